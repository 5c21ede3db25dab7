//! Hands the process over to a staged executable.

use std::convert::Infallible;
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::DATA_DIR_ENV;
use crate::error::LaunchError;

/// `<active>/bin`, then the existing search path, then `<active>/bin/aux`.
pub fn staged_search_path(
    active: &Path,
    existing: Option<&OsStr>,
) -> Result<OsString, LaunchError> {
    let bin = active.join("bin");
    let mut dirs = vec![bin.clone()];
    if let Some(existing) = existing {
        dirs.extend(env::split_paths(existing).filter(|p| !p.as_os_str().is_empty()));
    }
    dirs.push(bin.join("aux"));
    env::join_paths(dirs).map_err(|e| LaunchError::InvalidArgument(e.to_string()))
}

/// Resolve `command` the way a shell would. Names containing a `/` are
/// taken as paths.
pub fn look_path(command: &str, search_path: &OsStr) -> Result<PathBuf, LaunchError> {
    let not_found = || LaunchError::CommandResolution {
        command: command.to_string(),
    };
    if command.is_empty() {
        return Err(not_found());
    }
    if command.contains('/') {
        let path = PathBuf::from(command);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(not_found())
        };
    }
    env::split_paths(search_path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(not_found)
}

/// The current environment with the staged `PATH` and [`DATA_DIR_ENV`].
pub fn staged_env(active: &Path) -> Result<Vec<(OsString, OsString)>, LaunchError> {
    let path = staged_search_path(active, env::var_os("PATH").as_deref())?;
    let mut vars: Vec<_> = env::vars_os()
        .filter(|(key, _)| key != "PATH" && key != DATA_DIR_ENV)
        .collect();
    vars.push(("PATH".into(), path));
    vars.push((DATA_DIR_ENV.into(), active.as_os_str().to_owned()));
    Ok(vars)
}

/// Apply the staged environment to this process, for roles that run
/// in-process and spawn bundled binaries themselves.
pub fn export_staged_env(active: &Path) -> Result<(), LaunchError> {
    let path = staged_search_path(active, env::var_os("PATH").as_deref())?;
    // SAFETY: only called from main before the tokio runtime is built, while
    // the process is still single-threaded.
    unsafe {
        env::set_var("PATH", path);
        env::set_var(DATA_DIR_ENV, active);
    }
    Ok(())
}

/// Replace this process with `command` from the staged bundle. Only
/// returns on failure.
#[cfg(unix)]
pub fn exec(active: &Path, command: &str, args: &[OsString]) -> Result<Infallible, LaunchError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let to_cstring = |s: &OsStr| {
        CString::new(s.as_bytes())
            .map_err(|_| LaunchError::InvalidArgument(s.to_string_lossy().into_owned()))
    };

    let search_path = staged_search_path(active, env::var_os("PATH").as_deref())?;
    let program = look_path(command, &search_path)?;

    let path = to_cstring(program.as_os_str())?;
    let argv = std::iter::once(OsStr::new(command))
        .chain(args.iter().map(OsString::as_os_str))
        .map(to_cstring)
        .collect::<Result<Vec<_>, _>>()?;
    let envp = staged_env(active)?
        .into_iter()
        .map(|(mut key, value)| {
            key.push("=");
            key.push(value);
            to_cstring(&key)
        })
        .collect::<Result<Vec<_>, _>>()?;

    debug!("exec {} {args:?}", program.display());
    match nix::unistd::execve(&path, &argv, &envp) {
        Ok(never) => match never {},
        Err(errno) => Err(LaunchError::Exec {
            path: program,
            source: errno.into(),
        }),
    }
}

/// Without exec: run the child to completion and exit with its status.
#[cfg(not(unix))]
pub fn exec(active: &Path, command: &str, args: &[OsString]) -> Result<Infallible, LaunchError> {
    let search_path = staged_search_path(active, env::var_os("PATH").as_deref())?;
    let program = look_path(command, &search_path)?;

    debug!("running {} {args:?}", program.display());
    let status = std::process::Command::new(&program)
        .args(args)
        .env_clear()
        .envs(staged_env(active)?)
        .status()
        .map_err(|source| LaunchError::Exec {
            path: program.clone(),
            source,
        })?;
    std::process::exit(status.code().unwrap_or(1))
}

#[cfg(unix)]
pub(crate) fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub(crate) fn is_executable(path: &Path) -> bool {
    path.is_file()
}
