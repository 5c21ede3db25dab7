//! Command lines for the bundled `etcd` and `etcdutl` binaries.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{DatastoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    New,
    Existing,
}

impl ClusterState {
    fn as_str(self) -> &'static str {
        match self {
            ClusterState::New => "new",
            ClusterState::Existing => "existing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EtcdArgs {
    pub name: String,
    pub data_dir: PathBuf,
    pub listen_client_urls: Vec<String>,
    pub advertise_client_urls: Vec<String>,
    pub listen_peer_urls: Vec<String>,
    pub initial_advertise_peer_urls: Vec<String>,
    pub initial_cluster: String,
    pub initial_cluster_state: ClusterState,
}

impl EtcdArgs {
    pub fn to_args(&self) -> Vec<String> {
        vec![
            format!("--name={}", self.name),
            format!("--data-dir={}", self.data_dir.display()),
            format!("--listen-client-urls={}", self.listen_client_urls.join(",")),
            format!(
                "--advertise-client-urls={}",
                self.advertise_client_urls.join(",")
            ),
            format!("--listen-peer-urls={}", self.listen_peer_urls.join(",")),
            format!(
                "--initial-advertise-peer-urls={}",
                self.initial_advertise_peer_urls.join(",")
            ),
            format!("--initial-cluster={}", self.initial_cluster),
            format!(
                "--initial-cluster-state={}",
                self.initial_cluster_state.as_str()
            ),
        ]
    }

    pub fn spawn(&self, log_file: &Path) -> Result<Child> {
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        let args = self.to_args();
        debug!("launching etcd {args:?}");

        Command::new("etcd")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DatastoreError::Io(std::io::Error::new(e.kind(), format!("spawn etcd: {e}"))))
    }
}

/// `etcdutl snapshot restore` into `data_dir`, which must not exist yet.
pub async fn restore_snapshot(
    snapshot: &Path,
    data_dir: &Path,
    name: &str,
    peer_url: &str,
) -> Result<()> {
    let output = Command::new("etcdutl")
        .arg("snapshot")
        .arg("restore")
        .arg(snapshot)
        .arg(format!("--data-dir={}", data_dir.display()))
        .arg(format!("--name={name}"))
        .arg(format!("--initial-cluster={name}={peer_url}"))
        .arg(format!("--initial-advertise-peer-urls={peer_url}"))
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| DatastoreError::RestoreFailed(format!("run etcdutl: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DatastoreError::RestoreFailed(format!(
            "etcdutl exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}
