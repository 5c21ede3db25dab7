//! Snapshot files: naming, atomic writes and retention.
//!
//! Snapshots are named `<prefix>-<node>-<unix-millis>[.ext]`; the trailing
//! timestamp orders them, not the file mtime.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

pub fn snapshot_name(prefix: &str, node_name: &str, extension: Option<&str>) -> String {
    let ts = Utc::now().timestamp_millis();
    match extension {
        Some(ext) => format!("{prefix}-{node_name}-{ts}.{ext}"),
        None => format!("{prefix}-{node_name}-{ts}"),
    }
}

fn timestamp_of(file_name: &str) -> Option<i64> {
    let last = file_name.rsplit('-').next()?;
    last.split('.').next()?.parse().ok()
}

/// Snapshots in `dir` starting with `prefix-`, oldest first.
pub fn list(dir: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let wanted = format!("{prefix}-");
    let mut found = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&wanted) || name.ends_with(".partial") {
            continue;
        }
        if let Some(ts) = timestamp_of(&name) {
            found.push((ts, entry.path()));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Delete the oldest snapshots until at most `retention` remain.
/// A retention of zero keeps everything.
pub fn prune(dir: &Path, prefix: &str, retention: usize) -> io::Result<Vec<PathBuf>> {
    if retention == 0 {
        return Ok(Vec::new());
    }
    let snapshots = list(dir, prefix)?;
    let excess = snapshots.len().saturating_sub(retention);
    let mut removed = Vec::with_capacity(excess);
    for path in snapshots.into_iter().take(excess) {
        debug!("removing expired snapshot {}", path.display());
        fs::remove_file(&path)?;
        removed.push(path);
    }
    if !removed.is_empty() {
        info!(
            "pruned {} snapshot(s) from {}, retention {retention}",
            removed.len(),
            dir.display()
        );
    }
    Ok(removed)
}

/// Path a snapshot is streamed into before being renamed over `path`.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

pub fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = partial_path(path);
    fs::write(&partial, contents)?;
    fs::rename(&partial, path)
}
