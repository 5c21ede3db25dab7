use std::path::Path;

use anyhow::{Context, Result};

/// The cluster token from `--token`, else from `--token-file`. Blank values
/// count as unset.
pub fn resolve(token: Option<&str>, token_file: Option<&Path>) -> Result<Option<String>> {
    if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(Some(token.to_string()));
    }
    let Some(file) = token_file else {
        return Ok(None);
    };
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read token file {}", file.display()))?;
    Ok(Some(contents.trim().to_string()).filter(|t| !t.is_empty()))
}
