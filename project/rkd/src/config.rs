//! `--config` files.
//!
//! A config file is a YAML mapping whose keys are long flag names of the
//! role being started (`token`, `cluster-init`, `kube-apiserver-arg`, ...).
//! Its entries are turned into flags and inserted right after the role
//! name, ahead of the real command line, so explicit flags win.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_yaml::Value;
use tracing::debug;

pub const CONFIG_FILE_ENV: &str = "RKD_CONFIG_FILE";

/// Subcommands that accept `--config`.
const CONFIGURABLE: &[&str] = &["server", "agent"];

/// Splice the config file's flags into `argv`, if the invoked subcommand
/// takes one and a file is named on the command line or in
/// [`CONFIG_FILE_ENV`].
pub fn expand_args(argv: Vec<OsString>) -> Result<Vec<OsString>> {
    let Some(role_index) = role_index(&argv) else {
        return Ok(argv);
    };
    if !CONFIGURABLE.contains(&argv[role_index].to_string_lossy().as_ref()) {
        return Ok(argv);
    }

    let path = match config_flag(&argv[role_index + 1..]) {
        Some(path) => path,
        None => match std::env::var_os(CONFIG_FILE_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => return Ok(argv),
        },
    };

    let injected = load(&path)?;
    debug!("{} flag(s) from {}", injected.len(), path.display());
    let mut expanded = Vec::with_capacity(argv.len() + injected.len());
    expanded.extend_from_slice(&argv[..=role_index]);
    expanded.extend(injected);
    expanded.extend_from_slice(&argv[role_index + 1..]);
    Ok(expanded)
}

/// Position of the subcommand, skipping global options and their values.
fn role_index(argv: &[OsString]) -> Option<usize> {
    let mut i = 1;
    while i < argv.len() {
        let arg = argv[i].to_string_lossy();
        if arg == "--data-dir" || arg == "-d" {
            i += 2;
            continue;
        }
        if !arg.starts_with('-') {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn config_flag(args: &[OsString]) -> Option<PathBuf> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let arg = arg.to_string_lossy();
        if arg == "--" {
            break;
        }
        if arg == "--config" || arg == "-c" {
            return iter.next().map(PathBuf::from);
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(value));
        }
    }
    None
}

/// Flags for the entries of one config file.
pub fn load(path: &Path) -> Result<Vec<OsString>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    to_flags(&text).with_context(|| format!("invalid config file {}", path.display()))
}

pub fn to_flags(text: &str) -> Result<Vec<OsString>> {
    let doc: Value = serde_yaml::from_str(text)?;
    let map = match doc {
        Value::Null => return Ok(Vec::new()),
        Value::Mapping(map) => map,
        _ => bail!("top level must be a mapping"),
    };

    let mut flags = Vec::new();
    for (key, value) in map {
        let Some(key) = key.as_str() else {
            bail!("keys must be strings, found {key:?}");
        };
        if key == "config" {
            bail!("config files cannot name another config file");
        }
        match value {
            Value::Bool(true) => flags.push(OsString::from(format!("--{key}"))),
            Value::Bool(false) | Value::Null => {}
            Value::Sequence(items) => {
                for item in items {
                    flags.push(flag(key, &scalar(key, item)?));
                }
            }
            other => flags.push(flag(key, &scalar(key, other)?)),
        }
    }
    Ok(flags)
}

fn scalar(key: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => bail!("{key}: expected a string, number or boolean"),
    }
}

fn flag(key: &str, value: &str) -> OsString {
    let mut flag = OsString::from(format!("--{key}="));
    flag.push(OsStr::new(value));
    flag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn yaml_becomes_flags() {
        let flags = to_flags(
            "token: abc\ncluster-init: true\ndisable-scheduler: false\nhttps-listen-port: 7443\nkube-apiserver-arg:\n  - v=2\n  - audit-log-maxage=3\n",
        )
        .unwrap();
        assert_eq!(
            flags,
            args(&[
                "--token=abc",
                "--cluster-init",
                "--https-listen-port=7443",
                "--kube-apiserver-arg=v=2",
                "--kube-apiserver-arg=audit-log-maxage=3",
            ])
        );
    }

    #[test]
    fn nested_maps_are_rejected() {
        assert!(to_flags("token:\n  value: abc\n").is_err());
        assert!(to_flags("- a\n- b\n").is_err());
        assert!(to_flags("").unwrap().is_empty());
    }

    #[test]
    fn flags_are_spliced_after_the_role() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.yaml");
        std::fs::write(&file, "token: from-file\n").unwrap();
        let file = file.to_string_lossy().into_owned();

        let expanded = expand_args(args(&[
            "rkd", "-d", "/srv", "server", "--config", &file, "--token", "cli",
        ]))
        .unwrap();
        assert_eq!(
            expanded,
            args(&[
                "rkd",
                "-d",
                "/srv",
                "server",
                "--token=from-file",
                "--config",
                &file,
                "--token",
                "cli"
            ])
        );
    }

    #[test]
    fn tools_are_left_alone() {
        let argv = args(&["rkd", "kubectl", "--config", "/nope"]);
        assert_eq!(expand_args(argv.clone()).unwrap(), argv);
    }
}
