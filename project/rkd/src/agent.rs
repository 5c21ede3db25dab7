//! The `agent` role: container runtime and kubelet.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::AgentArgs;
use crate::components::Supervisor;
use crate::{datadir, host, token};

/// Where the agent keeps its files.
#[derive(Debug, Clone)]
pub struct AgentLayout {
    pub dir: PathBuf,
    pub containerd_root: PathBuf,
    pub containerd_state: PathBuf,
    pub kubelet_root: PathBuf,
    pub kubeconfig: PathBuf,
    pub crictl_config: PathBuf,
}

impl AgentLayout {
    pub fn new(data_dir: &Path, rootless: bool) -> Self {
        let dir = data_dir.join("agent");
        let containerd_state = if rootless {
            dir.join("run/containerd")
        } else {
            PathBuf::from("/run/rkd/containerd")
        };
        Self {
            containerd_root: dir.join("containerd"),
            containerd_state,
            kubelet_root: dir.join("kubelet"),
            kubeconfig: dir.join("kubelet.kubeconfig"),
            crictl_config: dir.join("etc/crictl.yaml"),
            dir,
        }
    }

    pub fn containerd_socket(&self) -> PathBuf {
        self.containerd_state.join("containerd.sock")
    }
}

/// Token and server URL, checked in the order the agent reports problems.
pub fn validate(args: &AgentArgs, root: bool) -> Result<(String, String)> {
    if !root && !args.rootless {
        bail!("agent must be run as root, or with --rootless");
    }
    let mut token = token::resolve(args.token.as_deref(), args.token_file.as_deref())?;
    if token.is_none() {
        if let Some(secret) = args.cluster_secret.as_deref().filter(|s| !s.is_empty()) {
            warn!("--cluster-secret is deprecated, use --token");
            token = Some(secret.to_string());
        }
    }
    let Some(token) = token else {
        bail!("--token is required");
    };
    let Some(server) = args.server_url.clone().filter(|s| !s.is_empty()) else {
        bail!("--server is required");
    };
    Ok((token, server))
}

#[derive(Serialize)]
struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<Named<ClusterEntry>>,
    users: Vec<Named<UserEntry>>,
    contexts: Vec<Named<ContextEntry>>,
    #[serde(rename = "current-context")]
    current_context: &'static str,
}

#[derive(Serialize)]
struct Named<T> {
    name: &'static str,
    #[serde(flatten)]
    value: T,
}

#[derive(Serialize)]
struct ClusterEntry {
    cluster: Server,
}

#[derive(Serialize)]
struct Server {
    server: String,
}

#[derive(Serialize)]
struct UserEntry {
    user: TokenUser,
}

#[derive(Serialize)]
struct TokenUser {
    token: String,
}

#[derive(Serialize)]
struct ContextEntry {
    context: ContextRef,
}

#[derive(Serialize)]
struct ContextRef {
    cluster: &'static str,
    user: &'static str,
}

#[derive(Serialize)]
struct CrictlConfig {
    #[serde(rename = "runtime-endpoint")]
    runtime_endpoint: String,
}

pub fn render_kubeconfig(server: &str, token: &str) -> Result<String> {
    let config = Kubeconfig {
        api_version: "v1",
        kind: "Config",
        clusters: vec![Named {
            name: "local",
            value: ClusterEntry {
                cluster: Server {
                    server: server.to_string(),
                },
            },
        }],
        users: vec![Named {
            name: "kubelet",
            value: UserEntry {
                user: TokenUser {
                    token: token.to_string(),
                },
            },
        }],
        contexts: vec![Named {
            name: "default",
            value: ContextEntry {
                context: ContextRef {
                    cluster: "local",
                    user: "kubelet",
                },
            },
        }],
        current_context: "default",
    };
    Ok(serde_yaml::to_string(&config)?)
}

pub fn render_crictl_config(runtime_endpoint: &str) -> Result<String> {
    Ok(serde_yaml::to_string(&CrictlConfig {
        runtime_endpoint: runtime_endpoint.to_string(),
    })?)
}

/// Write a file only the owner can read.
fn write_private(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut options = fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

pub fn containerd_args(layout: &AgentLayout) -> Vec<String> {
    vec![
        format!("--root={}", layout.containerd_root.display()),
        format!("--state={}", layout.containerd_state.display()),
        format!("--address={}", layout.containerd_socket().display()),
    ]
}

pub fn kubelet_args(
    args: &AgentArgs,
    layout: &AgentLayout,
    node_name: &str,
    runtime_endpoint: &str,
) -> Vec<String> {
    let mut out = vec![
        format!("--hostname-override={node_name}"),
        format!("--root-dir={}", layout.kubelet_root.display()),
        format!("--kubeconfig={}", layout.kubeconfig.display()),
        format!("--container-runtime-endpoint={runtime_endpoint}"),
    ];
    out.extend(args.kubelet_arg.iter().map(|arg| {
        if arg.starts_with("--") {
            arg.clone()
        } else {
            format!("--{arg}")
        }
    }));
    out
}

pub async fn run(args: AgentArgs, data_dir: PathBuf, cancel: CancellationToken) -> Result<()> {
    let (token, server) = validate(&args, datadir::is_root())?;
    let node_name = host::node_name(args.node_name.as_deref())?;
    let layout = AgentLayout::new(&data_dir, args.rootless);
    info!("starting agent {node_name}, server {server}");

    write_private(&layout.kubeconfig, &render_kubeconfig(&server, &token)?)?;

    let mut supervisor = Supervisor::new(layout.dir.join("logs"));
    let runtime_endpoint = match args.container_runtime_endpoint.as_deref() {
        Some(endpoint) if !endpoint.is_empty() => {
            info!("using external container runtime {endpoint}");
            endpoint.to_string()
        }
        _ => {
            fs::create_dir_all(&layout.containerd_state).with_context(|| {
                format!("failed to create {}", layout.containerd_state.display())
            })?;
            supervisor.spawn("containerd", &containerd_args(&layout))?;
            format!("unix://{}", layout.containerd_socket().display())
        }
    };
    write_private(
        &layout.crictl_config,
        &render_crictl_config(&runtime_endpoint)?,
    )?;

    let result = match supervisor.spawn(
        "kubelet",
        &kubelet_args(&args, &layout, &node_name, &runtime_endpoint),
    ) {
        Ok(_) => tokio::select! {
            _ = cancel.cancelled() => {
                info!("agent shutting down");
                Ok(())
            }
            res = supervisor.wait_any() => res,
        },
        Err(e) => Err(e),
    };
    supervisor.shutdown().await;
    result
}
