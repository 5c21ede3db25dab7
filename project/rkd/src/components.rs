//! Supervision of the external processes a role runs.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Children of one role. Every child is killed when the supervisor is
/// dropped.
pub struct Supervisor {
    log_dir: PathBuf,
    children: JoinSet<(String, std::io::Result<ExitStatus>)>,
}

impl Supervisor {
    /// Child output goes to `<log_dir>/<name>.log`.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            children: JoinSet::new(),
        }
    }

    pub fn spawn(&mut self, name: &str, args: &[String]) -> Result<u32> {
        self.spawn_program(name, name, args)
    }

    pub fn spawn_program(&mut self, name: &str, program: &str, args: &[String]) -> Result<u32> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        let log_path = self.log_dir.join(format!("{name}.log"));
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open {}", log_path.display()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {name}"))?;
        let pid = child.id().unwrap_or_default();
        info!("started {name} (pid {pid}), logging to {}", log_path.display());

        let name = name.to_string();
        self.children
            .spawn(async move { (name, child.wait().await) });
        Ok(pid)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Resolves when the first child exits. Components are expected to run
    /// for the life of the role, so any exit is an error. Never resolves
    /// with no children.
    pub async fn wait_any(&mut self) -> Result<()> {
        let Some(joined) = self.children.join_next().await else {
            return std::future::pending().await;
        };
        let (name, status) = joined.context("component watcher panicked")?;
        match status {
            Ok(status) => {
                warn!("{name} exited with {status}");
                Err(anyhow!("{name} exited with {status}"))
            }
            Err(e) => Err(anyhow!("failed to wait for {name}: {e}")),
        }
    }

    /// Kill every child.
    pub async fn shutdown(&mut self) {
        self.children.shutdown().await;
    }
}
