use anyhow::Result;

/// `--node-name`, else the host name, lower-cased.
pub fn node_name(requested: Option<&str>) -> Result<String> {
    if let Some(name) = requested.map(str::trim).filter(|n| !n.is_empty()) {
        return Ok(name.to_lowercase());
    }
    Ok(hostname()?.to_lowercase())
}

#[cfg(unix)]
fn hostname() -> Result<String> {
    use anyhow::Context;

    let name = nix::unistd::gethostname().context("failed to read hostname")?;
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn hostname() -> Result<String> {
    use anyhow::Context;

    std::env::var("COMPUTERNAME").context("failed to read hostname")
}
