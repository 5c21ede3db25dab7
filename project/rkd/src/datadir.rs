//! Where rkd keeps its state.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// System-wide data directory, also the default for root.
pub const GLOBAL_DATA_DIR: &str = "/var/lib/rkd";
const LOCAL_DATA_DIR: &str = ".rkd";

#[cfg(unix)]
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
pub fn is_root() -> bool {
    false
}

/// Effective data directory for a requested one: the root or per-user
/// default when nothing was requested, `~` expanded, made absolute.
pub fn resolve(requested: Option<&Path>) -> Result<PathBuf> {
    let home = dirs::home_dir();
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    resolve_with(requested, is_root(), home.as_deref(), &cwd)
}

pub fn resolve_with(
    requested: Option<&Path>,
    root: bool,
    home: Option<&Path>,
    cwd: &Path,
) -> Result<PathBuf> {
    let requested = requested.filter(|p| !p.as_os_str().is_empty());
    let dir = match requested {
        Some(dir) => expand_home(dir, home)?,
        None if root => PathBuf::from(GLOBAL_DATA_DIR),
        None => home
            .context("cannot determine home directory for the default data dir")?
            .join(LOCAL_DATA_DIR),
    };
    Ok(if dir.is_absolute() { dir } else { cwd.join(dir) })
}

fn expand_home(dir: &Path, home: Option<&Path>) -> Result<PathBuf> {
    let Ok(rest) = dir.strip_prefix("~") else {
        return Ok(dir.to_path_buf());
    };
    let home = home.with_context(|| format!("cannot expand {}", dir.display()))?;
    Ok(home.join(rest))
}
