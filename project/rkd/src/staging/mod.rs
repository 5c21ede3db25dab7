//! Stages the bundled executables into the data directory.
//!
//! Layout under `<data-dir>/data`:
//!
//! ```text
//! .lock
//! <version>/bin/...        one directory per staged bundle
//! <version>/bin/aux/...
//! current  -> <version>    last published version
//! previous -> <version>    the version `current` pointed at before
//! ```
//!
//! A version directory only ever appears by renaming a fully unpacked and
//! verified `<version>-tmp`, and the symlinks are only swapped after that
//! rename, so `current` never points at a partial tree. A version directory
//! that `current` does not name yet is republished on the next extract.

mod lock;
mod untar;
mod verify;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::assets::{Asset, Assets};
use crate::datadir::{self, GLOBAL_DATA_DIR};
use crate::error::StagingError;

pub use lock::StagingLock;
pub use verify::verify;

pub const CURRENT_LINK: &str = "current";
pub const PREVIOUS_LINK: &str = "previous";
const LOCK_FILE: &str = ".lock";

pub struct StagingManager {
    assets: Assets,
    global_dir: PathBuf,
}

impl StagingManager {
    pub fn new(assets: Assets) -> Self {
        Self {
            assets,
            global_dir: PathBuf::from(GLOBAL_DATA_DIR),
        }
    }

    /// Override the system-wide directory consulted before `data_dir`.
    pub fn with_global_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.global_dir = dir.into();
        self
    }

    /// Effective data directory for a `--data-dir` value. No side effects.
    pub fn resolve(&self, requested: Option<&Path>) -> anyhow::Result<PathBuf> {
        datadir::resolve(requested)
    }

    pub fn assets(&self) -> &Assets {
        &self.assets
    }

    /// Make the primary bundle available under `data_dir` and return its
    /// version directory. Safe to call from many processes at once.
    pub fn extract(&self, data_dir: &Path) -> Result<PathBuf, StagingError> {
        let asset = self.assets.primary().ok_or_else(|| StagingError::PayloadRead {
            name: "embedded bundle".to_string(),
            reason: "this binary was built without a bundle".to_string(),
        })?;
        let version = asset.version_id();

        let global = self.global_dir.join("data").join(version);
        if global.is_dir() {
            debug!("using system-wide {}", global.display());
            return Ok(global);
        }

        let data_root = data_dir.join("data");
        let target = data_root.join(version);
        if target.is_dir() && is_current(&data_root, &target) {
            return Ok(target);
        }

        fs::create_dir_all(&data_root)?;
        let _lock = StagingLock::acquire(&data_root.join(LOCK_FILE))?;
        if target.is_dir() {
            if !is_current(&data_root, &target) {
                // unpacked by a run that died before swapping the links
                info!("publishing already staged {}", target.display());
                publish_links(&data_root, &target)?;
            } else {
                debug!("{} staged by another process", target.display());
            }
            return Ok(target);
        }

        let tmp = data_root.join(format!("{version}-tmp"));
        let result = stage(asset, &data_root, &tmp, &target);
        if let Err(e) = remove_dir_if_exists(&tmp) {
            warn!("failed to clean up {}: {e}", tmp.display());
        }
        result?;

        info!("staged {} into {}", asset.name(), target.display());
        Ok(target)
    }
}

fn stage(asset: &Asset, data_root: &Path, tmp: &Path, target: &Path) -> Result<(), StagingError> {
    remove_dir_if_exists(tmp)?;
    untar::unpack(asset.data(), tmp)?;
    verify::verify(tmp)?;

    fs::rename(tmp, target).map_err(|source| StagingError::Publish {
        path: target.to_path_buf(),
        source,
    })?;
    publish_links(data_root, target)
}

fn is_current(data_root: &Path, target: &Path) -> bool {
    fs::read_link(data_root.join(CURRENT_LINK)).is_ok_and(|link| link == target)
}

fn publish_links(data_root: &Path, target: &Path) -> Result<(), StagingError> {
    publish(data_root, target).map_err(|source| StagingError::Publish {
        path: data_root.join(CURRENT_LINK),
        source,
    })
}

/// Point `current` at `target`, keeping the old `current` as `previous`.
fn publish(data_root: &Path, target: &Path) -> io::Result<()> {
    let current = data_root.join(CURRENT_LINK);
    match fs::read_link(&current) {
        Ok(old) if old != target => replace_symlink(&old, &data_root.join(PREVIOUS_LINK))?,
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    replace_symlink(target, &current)
}

/// Create a symlink under a scratch name and rename it over `link`, so
/// readers see either the old or the new target.
fn replace_symlink(target: &Path, link: &Path) -> io::Result<()> {
    let name = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let scratch = link.with_file_name(format!(".{name}.new"));
    match fs::remove_file(&scratch) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    symlink_dir(target, &scratch)?;
    fs::rename(&scratch, link)
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
