//! etcd datastore, run as a child process of the server.
//!
//! Member data lives in `<server-data-dir>/db/etcd`. A node counts as
//! initialized once etcd has written its WAL there. Joining nodes ask an
//! existing server for its etcd client URLs (`GET /db/info`), add themselves
//! as a member, then launch etcd with the resulting initial cluster.

mod process;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use etcd_client::{Client, ConnectOptions};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{ClientAccessInfo, ControlConfig};
use crate::driver::Driver;
use crate::error::{DatastoreError, Result};
use crate::snapshot;

pub use process::{ClusterState, EtcdArgs};

pub const ENDPOINT_NAME: &str = "etcd";
const SNAPSHOT_PREFIX: &str = "etcd-snapshot";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What a server tells joining nodes about its own etcd member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    pub client_urls: Vec<String>,
    pub peer_urls: Vec<String>,
}

pub struct EtcdDriver {
    config: OnceLock<ControlConfig>,
    child: Mutex<Option<Child>>,
}

impl Default for EtcdDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl EtcdDriver {
    pub fn new() -> Self {
        Self {
            config: OnceLock::new(),
            child: Mutex::new(None),
        }
    }

    fn config(&self) -> Result<&ControlConfig> {
        self.config
            .get()
            .ok_or_else(|| DatastoreError::NotRegistered(ENDPOINT_NAME.to_string()))
    }

    async fn join(&self, cfg: &ControlConfig, access: &ClientAccessInfo) -> Result<String> {
        let server = fetch_member_info(access).await?;
        if server.client_urls.is_empty() {
            return Err(DatastoreError::Join(format!(
                "{} reported no etcd client urls",
                access.url
            )));
        }
        info!(
            "adding etcd member {} via {:?}",
            cfg.node_name, server.client_urls
        );

        let own_peer = peer_url(cfg);
        let mut client = connect(&server.client_urls)
            .await
            .map_err(|e| DatastoreError::Join(format!("connect to etcd: {e}")))?;
        let resp = client.member_add(vec![own_peer.clone()], None).await?;

        let mut cluster = Vec::new();
        for member in resp.member_list() {
            let is_self = member.peer_urls().iter().any(|u| *u == own_peer);
            let name = if is_self {
                cfg.node_name.as_str()
            } else {
                member.name()
            };
            // unnamed members were added but never started
            if name.is_empty() {
                continue;
            }
            for url in member.peer_urls() {
                cluster.push(format!("{name}={url}"));
            }
        }
        Ok(cluster.join(","))
    }
}

pub fn data_dir(cfg: &ControlConfig) -> PathBuf {
    cfg.db_dir().join("etcd")
}

fn wal_dir(cfg: &ControlConfig) -> PathBuf {
    data_dir(cfg).join("member").join("wal")
}

fn peer_url(cfg: &ControlConfig) -> String {
    format!("http://{}:{}", cfg.advertise_ip, cfg.etcd_peer_port)
}

fn client_url(cfg: &ControlConfig) -> String {
    format!("http://{}:{}", cfg.advertise_ip, cfg.etcd_client_port)
}

fn local_client_url(cfg: &ControlConfig) -> String {
    format!("http://127.0.0.1:{}", cfg.etcd_client_port)
}

fn listen_client_urls(cfg: &ControlConfig) -> Vec<String> {
    let mut urls = vec![local_client_url(cfg)];
    let advertised = client_url(cfg);
    if !urls.contains(&advertised) {
        urls.push(advertised);
    }
    urls
}

fn member_info(cfg: &ControlConfig) -> MemberInfo {
    MemberInfo {
        name: cfg.node_name.clone(),
        client_urls: vec![client_url(cfg)],
        peer_urls: vec![peer_url(cfg)],
    }
}

async fn connect(endpoints: &[String]) -> Result<Client> {
    let options = ConnectOptions::new()
        .with_connect_timeout(CONNECT_TIMEOUT)
        .with_timeout(REQUEST_TIMEOUT);
    Ok(Client::connect(endpoints, Some(options)).await?)
}

/// Move existing member data out of the way, keeping it for manual recovery.
fn move_aside(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }
    let aside = dir.with_file_name(format!("etcd-old-{}", Utc::now().timestamp()));
    fs::rename(dir, &aside)?;
    Ok(Some(aside))
}

pub async fn fetch_member_info(access: &ClientAccessInfo) -> Result<MemberInfo> {
    let url = format!("{}/db/info", access.url.trim_end_matches('/'));
    let resp = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?
        .get(&url)
        .bearer_auth(&access.token)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(DatastoreError::Join(format!(
            "GET {url} returned {}",
            resp.status()
        )));
    }
    Ok(resp.json().await?)
}

struct DbInfoState {
    member: MemberInfo,
    token: Option<String>,
}

async fn db_info(State(state): State<Arc<DbInfoState>>, headers: HeaderMap) -> Response {
    if let Some(token) = state.token.as_deref() {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(token) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    Json(state.member.clone()).into_response()
}

async fn stream_snapshot(endpoint: String, partial: &Path) -> Result<()> {
    let mut client = connect(&[endpoint]).await?;
    let mut stream = client.snapshot().await?;
    let mut file = tokio::fs::File::create(partial).await?;
    while let Some(resp) = stream.message().await? {
        file.write_all(resp.blob()).await?;
    }
    file.sync_all().await?;
    Ok(())
}

#[async_trait]
impl Driver for EtcdDriver {
    fn endpoint_name(&self) -> &str {
        ENDPOINT_NAME
    }

    async fn is_initialized(&self, config: &ControlConfig) -> Result<bool> {
        Ok(wal_dir(config).is_dir())
    }

    async fn register(&self, config: &ControlConfig, router: Router) -> Result<Router> {
        if self.config.set(config.clone()).is_err() {
            warn!("etcd driver registered twice, keeping the first config");
        }
        let state = Arc::new(DbInfoState {
            member: member_info(config),
            token: config.token.clone().filter(|t| !t.is_empty()),
        });
        Ok(router.merge(
            Router::new()
                .route("/db/info", get(db_info))
                .with_state(state),
        ))
    }

    async fn start(&self, access: Option<ClientAccessInfo>) -> Result<()> {
        let cfg = self.config()?;
        let mut child = self.child.lock().await;
        if child.is_some() {
            return Err(DatastoreError::AlreadyRunning(ENDPOINT_NAME.to_string()));
        }

        let (initial_cluster, state) = match &access {
            Some(access) => (self.join(cfg, access).await?, ClusterState::Existing),
            None => (
                format!("{}={}", cfg.node_name, peer_url(cfg)),
                ClusterState::New,
            ),
        };

        fs::create_dir_all(cfg.db_dir())?;
        let args = EtcdArgs {
            name: cfg.node_name.clone(),
            data_dir: data_dir(cfg),
            listen_client_urls: listen_client_urls(cfg),
            advertise_client_urls: vec![client_url(cfg)],
            listen_peer_urls: vec![peer_url(cfg)],
            initial_advertise_peer_urls: vec![peer_url(cfg)],
            initial_cluster,
            initial_cluster_state: state,
        };
        let spawned = args.spawn(&cfg.db_dir().join("etcd.log"))?;
        info!(
            "etcd started (pid {:?}, data {})",
            spawned.id(),
            args.data_dir.display()
        );
        *child = Some(spawned);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let cfg = self.config()?;
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("failed to stop etcd: {e}");
            }
        }
        match move_aside(&data_dir(cfg))? {
            Some(aside) => info!("etcd data moved to {}", aside.display()),
            None => info!("no etcd data at {}", data_dir(cfg).display()),
        }
        Ok(())
    }

    async fn test(&self) -> Result<()> {
        let cfg = self.config()?;
        if let Some(child) = self.child.lock().await.as_mut() {
            if let Some(status) = child.try_wait()? {
                return Err(DatastoreError::Connectivity(format!(
                    "etcd exited with {status}"
                )));
            }
        }

        let mut client = connect(&[local_client_url(cfg)])
            .await
            .map_err(|e| DatastoreError::Connectivity(e.to_string()))?;
        let status = client
            .status()
            .await
            .map_err(|e| DatastoreError::Connectivity(e.to_string()))?;
        if status.leader() == 0 {
            return Err(DatastoreError::Connectivity(
                "etcd has no leader".to_string(),
            ));
        }
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        let cfg = self.config()?;
        let snapshot = cfg.restore_path.as_deref().ok_or_else(|| {
            DatastoreError::RestoreFailed("no snapshot path configured".to_string())
        })?;
        if !snapshot.is_file() {
            return Err(DatastoreError::RestoreFailed(format!(
                "snapshot {} does not exist",
                snapshot.display()
            )));
        }
        if self.child.lock().await.is_some() {
            return Err(DatastoreError::AlreadyRunning(ENDPOINT_NAME.to_string()));
        }

        let target = data_dir(cfg);
        let scratch = target.with_file_name("etcd-restore-tmp");
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }
        fs::create_dir_all(cfg.db_dir())?;

        if let Err(e) =
            process::restore_snapshot(snapshot, &scratch, &cfg.node_name, &peer_url(cfg)).await
        {
            let _ = fs::remove_dir_all(&scratch);
            return Err(e);
        }
        if let Some(aside) = move_aside(&target)? {
            info!("previous etcd data moved to {}", aside.display());
        }
        fs::rename(&scratch, &target)?;
        info!("etcd data restored from {}", snapshot.display());
        Ok(())
    }

    async fn snapshot(&self) -> Result<PathBuf> {
        let cfg = self.config()?;
        let dir = cfg.snapshot_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(snapshot::snapshot_name(
            SNAPSHOT_PREFIX,
            &cfg.node_name,
            None,
        ));
        let partial = snapshot::partial_path(&path);

        if let Err(e) = stream_snapshot(local_client_url(cfg), &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, &path).await?;
        info!("etcd snapshot written to {}", path.display());

        snapshot::prune(&dir, SNAPSHOT_PREFIX, cfg.snapshot.retention)?;
        Ok(path)
    }

    fn client_urls(&self) -> Vec<String> {
        self.config
            .get()
            .map(|cfg| vec![local_client_url(cfg)])
            .unwrap_or_default()
    }
}
