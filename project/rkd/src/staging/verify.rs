//! Checks an unpacked bundle before it is published.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::StagingError;
use crate::launch::is_executable;

/// Optional digest list under `bin/`: one `<sha256-hex>  <path>` per line,
/// paths relative to `bin/`.
const CHECKSUM_FILE: &str = ".sha256sums";

pub fn verify(root: &Path) -> Result<(), StagingError> {
    let failed = |reason: String| StagingError::Verification {
        path: root.to_path_buf(),
        reason,
    };
    let bin = root.join("bin");
    if !bin.is_dir() {
        return Err(failed("missing bin/ directory".to_string()));
    }

    let sums = bin.join(CHECKSUM_FILE);
    if sums.is_file() {
        let listing = fs::read_to_string(&sums)
            .map_err(|e| failed(format!("read {CHECKSUM_FILE}: {e}")))?;
        for (lineno, line) in listing.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((expected, name)) = line.split_once(char::is_whitespace) else {
                return Err(failed(format!(
                    "{CHECKSUM_FILE}:{}: malformed line",
                    lineno + 1
                )));
            };
            let name = name.trim_start().trim_start_matches('*');
            let file = bin.join(name);
            if !is_executable(&file) {
                return Err(failed(format!("bin/{name} is missing or not executable")));
            }
            let actual = sha256_file(&file).map_err(|e| failed(format!("hash bin/{name}: {e}")))?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(failed(format!(
                    "bin/{name}: digest {actual} does not match {expected}"
                )));
            }
        }
    }

    for entry in WalkDir::new(&bin) {
        let entry = entry.map_err(|e| failed(e.to_string()))?;
        if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if !is_executable(entry.path()) {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            return Err(failed(format!("{} is not executable", rel.display())));
        }
    }
    Ok(())
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn write(root: &Path, rel: &str, data: &[u8], mode: u32) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, data).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn executables_pass() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bin/kubectl", b"k", 0o755);
        write(dir.path(), "bin/aux/iptables", b"i", 0o700);
        write(dir.path(), "bin/.hidden", b"h", 0o644);
        write(dir.path(), "README", b"r", 0o644);
        verify(dir.path()).unwrap();
    }

    #[test]
    fn missing_bin_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            verify(dir.path()),
            Err(StagingError::Verification { .. })
        ));
    }

    #[test]
    fn non_executable_fails() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bin/kubectl", b"k", 0o755);
        write(dir.path(), "bin/aux/config.txt", b"c", 0o644);
        let err = verify(dir.path()).unwrap_err();
        assert!(err.to_string().contains("bin/aux/config.txt"));
    }

    #[test]
    fn checksums_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bin/kubectl", b"kubectl", 0o755);
        let digest = sha256_file(&dir.path().join("bin/kubectl")).unwrap();

        write(dir.path(), "bin/.sha256sums", format!("{digest}  kubectl\n").as_bytes(), 0o644);
        verify(dir.path()).unwrap();

        write(dir.path(), "bin/.sha256sums", format!("{digest}  crictl\n").as_bytes(), 0o644);
        assert!(verify(dir.path()).is_err());

        let wrong = "0".repeat(64);
        write(dir.path(), "bin/.sha256sums", format!("{wrong}  kubectl\n").as_bytes(), 0o644);
        let err = verify(dir.path()).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
