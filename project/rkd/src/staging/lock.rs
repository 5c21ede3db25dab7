//! Exclusive lock on `<data-dir>/data/.lock`, shared by every rkd process
//! on the host.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::StagingError;

/// Held for as long as the value lives; dropping it releases the lock.
#[derive(Debug)]
pub struct StagingLock {
    path: PathBuf,
    #[cfg(unix)]
    _file: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl StagingLock {
    /// Blocks until the lock is free. There is no timeout: the kernel drops
    /// the lock of a holder that dies, so a held lock always has a live owner.
    pub fn acquire(path: &Path) -> Result<Self, StagingError> {
        let failed = |source| StagingError::LockAcquisition {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(failed)?;

        debug!("waiting for {}", path.display());
        let file = lock_exclusive(file).map_err(failed)?;
        debug!("locked {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

#[cfg(unix)]
fn lock_exclusive(mut file: File) -> std::io::Result<nix::fcntl::Flock<File>> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    loop {
        match Flock::lock(file, FlockArg::LockExclusive) {
            Ok(lock) => return Ok(lock),
            Err((f, Errno::EINTR)) => file = f,
            Err((_, errno)) => return Err(errno.into()),
        }
    }
}

#[cfg(not(unix))]
fn lock_exclusive(file: File) -> std::io::Result<File> {
    file.lock()?;
    Ok(file)
}

impl Drop for StagingLock {
    fn drop(&mut self) {
        debug!("unlocked {}", self.path.display());
    }
}
