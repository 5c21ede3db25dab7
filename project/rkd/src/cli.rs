use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::PROGRAM;

/// Bundled tools that can be run through `rkd <tool>` or a symlink named
/// after the tool.
pub const TOOLS: &[&str] = &["kubectl", "crictl", "ctr", "check-config"];

#[derive(Parser, Debug)]
#[command(name = "rkd", version, about = "The rk cluster in a single binary")]
pub struct Cli {
    /// Turn on debug logs
    #[arg(long, global = true, env = "RKD_DEBUG")]
    pub debug: bool,

    /// Folder to hold state (default: /var/lib/rkd, or ~/.rkd if not root)
    #[arg(short = 'd', long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run management server
    #[command(args_override_self = true)]
    Server(ServerArgs),

    /// Run node agent
    #[command(args_override_self = true)]
    Agent(AgentArgs),

    /// Run kubectl
    #[command(disable_help_flag = true)]
    Kubectl(ToolArgs),

    /// Run crictl
    #[command(disable_help_flag = true)]
    Crictl(ToolArgs),

    /// Run ctr
    #[command(disable_help_flag = true)]
    Ctr(ToolArgs),

    /// Check host configuration
    #[command(disable_help_flag = true)]
    CheckConfig(ToolArgs),

    /// Manage datastore snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
}

impl Commands {
    /// The bundled tool and its arguments, for tool subcommands.
    pub fn tool(&self) -> Option<(&'static str, &[OsString])> {
        match self {
            Commands::Kubectl(t) => Some(("kubectl", &t.args)),
            Commands::Crictl(t) => Some(("crictl", &t.args)),
            Commands::Ctr(t) => Some(("ctr", &t.args)),
            Commands::CheckConfig(t) => Some(("check-config", &t.args)),
            _ => None,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ToolArgs {
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    pub args: Vec<OsString>,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// Take a datastore snapshot now
    Save(ServerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Load configuration from FILE
    #[arg(short = 'c', long, env = "RKD_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Shared secret used to join a server or agent to a cluster
    #[arg(short = 't', long, env = "RKD_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// File containing the cluster secret/token
    #[arg(long, env = "RKD_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// Server to connect to, used to join a cluster
    #[arg(short = 's', long = "server", env = "RKD_URL")]
    pub server_url: Option<String>,

    /// Initialize a new cluster using embedded etcd
    #[arg(long, env = "RKD_CLUSTER_INIT")]
    pub cluster_init: bool,

    /// Forget all peers and become sole member of a new cluster
    #[arg(long, env = "RKD_CLUSTER_RESET")]
    pub cluster_reset: bool,

    /// Path to snapshot file to be restored
    #[arg(long)]
    pub cluster_reset_restore_path: Option<PathBuf>,

    /// Specify etcd, sqlite or postgres data source name
    #[arg(long, env = "RKD_DATASTORE_ENDPOINT", default_value = "")]
    pub datastore_endpoint: String,

    /// TLS Certificate Authority file used to secure datastore backend communication
    #[arg(long, env = "RKD_DATASTORE_CAFILE")]
    pub datastore_cafile: Option<PathBuf>,

    /// TLS certification file used to secure datastore backend communication
    #[arg(long, env = "RKD_DATASTORE_CERTFILE")]
    pub datastore_certfile: Option<PathBuf>,

    /// TLS key file used to secure datastore backend communication
    #[arg(long, env = "RKD_DATASTORE_KEYFILE")]
    pub datastore_keyfile: Option<PathBuf>,

    /// Seconds to wait for the datastore to become ready
    #[arg(long, default_value_t = 120)]
    pub datastore_ready_timeout: u64,

    /// Disable automatic datastore snapshots
    #[arg(long)]
    pub etcd_disable_snapshots: bool,

    /// Directory to save datastore snapshots (default: ${data-dir}/server/db/snapshots)
    #[arg(long)]
    pub etcd_snapshot_dir: Option<PathBuf>,

    /// Number of snapshots to retain
    #[arg(long, default_value_t = 5)]
    pub etcd_snapshot_retention: usize,

    /// Hours between automatic snapshots
    #[arg(long, default_value_t = 12)]
    pub etcd_snapshot_interval_hours: u64,

    /// Disable the kube-scheduler
    #[arg(long)]
    pub disable_scheduler: bool,

    /// Address the supervisor and apiserver listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_address: String,

    /// HTTPS listen port of the apiserver
    #[arg(long, default_value_t = 6443)]
    pub https_listen_port: u16,

    /// Listen port of the supervisor API that joining nodes talk to
    #[arg(long, default_value_t = 9345)]
    pub supervisor_port: u16,

    /// IP address that apiserver and etcd advertise to members of the cluster
    #[arg(long)]
    pub advertise_address: Option<String>,

    /// Node name
    #[arg(long, env = "RKD_NODE_NAME")]
    pub node_name: Option<String>,

    /// Customized flag for kube-apiserver process
    #[arg(long)]
    pub kube_apiserver_arg: Vec<String>,

    /// Customized flag for kube-scheduler process
    #[arg(long)]
    pub kube_scheduler_arg: Vec<String>,

    /// Customized flag for kube-controller-manager process
    #[arg(long)]
    pub kube_controller_manager_arg: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct AgentArgs {
    /// Load configuration from FILE
    #[arg(short = 'c', long, env = "RKD_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Token to use for authentication
    #[arg(short = 't', long, env = "RKD_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Token file to use for authentication
    #[arg(long, env = "RKD_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// Server to connect to
    #[arg(short = 's', long = "server", env = "RKD_URL")]
    pub server_url: Option<String>,

    /// Shared secret used to bootstrap a cluster (deprecated, use --token)
    #[arg(long, env = "RKD_CLUSTER_SECRET", hide = true, hide_env_values = true)]
    pub cluster_secret: Option<String>,

    /// Node name
    #[arg(long, env = "RKD_NODE_NAME")]
    pub node_name: Option<String>,

    /// Run rootless
    #[arg(long)]
    pub rootless: bool,

    /// Use an external container runtime instead of the bundled containerd
    #[arg(long)]
    pub container_runtime_endpoint: Option<String>,

    /// Customized flag for kubelet process
    #[arg(long)]
    pub kubelet_arg: Vec<String>,
}

/// Tool to run directly when invoked through a symlink named after it
/// (`kubectl get pods`) or as the first argument (`rkd kubectl get pods`).
/// Arguments are handed over untouched.
pub fn tool_invocation(argv: &[OsString]) -> Option<(&'static str, Vec<OsString>)> {
    let find = |name: &OsString| {
        let name = Path::new(name).file_name()?.to_str()?;
        TOOLS.iter().copied().find(|tool| *tool == name)
    };
    let invoked = argv.first()?;
    if Path::new(invoked).file_name().and_then(|n| n.to_str()) != Some(PROGRAM) {
        if let Some(tool) = find(invoked) {
            return Some((tool, argv[1..].to_vec()));
        }
    }
    let tool = argv.get(1).and_then(|arg| {
        let name = arg.to_str()?;
        TOOLS.iter().copied().find(|tool| *tool == name)
    })?;
    Some((tool, argv[2..].to_vec()))
}
