//! The `server` role: datastore, supervisor API and control plane.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::Router;
use axum::routing::get;
use libdatastore::{
    BootstrapOutcome, ClusterBootstrapper, ControlConfig, DatastoreConfig, DatastoreError, Driver,
    DriverRegistry, SnapshotConfig,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::ServerArgs;
use crate::components::Supervisor;
use crate::{host, token};

/// Driver used when `--datastore-endpoint` is empty.
pub fn default_driver(args: &ServerArgs) -> &'static str {
    if args.cluster_init || args.server_url.as_deref().is_some_and(|u| !u.is_empty()) {
        "etcd"
    } else {
        "sqlite"
    }
}

pub fn registry(args: &ServerArgs) -> DriverRegistry {
    let mut registry = DriverRegistry::builtin();
    registry.set_default(default_driver(args));
    registry
}

pub fn control_config(
    args: &ServerArgs,
    server_dir: &Path,
    token: Option<String>,
    node_name: String,
) -> ControlConfig {
    let mut cfg = ControlConfig::new(server_dir, node_name);
    if let Some(ip) = args.advertise_address.as_deref().filter(|ip| !ip.is_empty()) {
        cfg.advertise_ip = ip.to_string();
    }
    cfg.datastore = DatastoreConfig {
        endpoint: args.datastore_endpoint.clone(),
        ca_file: args.datastore_cafile.clone(),
        cert_file: args.datastore_certfile.clone(),
        key_file: args.datastore_keyfile.clone(),
    };
    cfg.token = token;
    cfg.join_url = args.server_url.clone().filter(|u| !u.is_empty());
    cfg.cluster_reset = args.cluster_reset;
    cfg.restore_path = args.cluster_reset_restore_path.clone();
    cfg.snapshot = SnapshotConfig {
        disabled: args.etcd_disable_snapshots || args.etcd_snapshot_interval_hours == 0,
        dir: args.etcd_snapshot_dir.clone(),
        retention: args.etcd_snapshot_retention,
        interval: Duration::from_secs(args.etcd_snapshot_interval_hours.saturating_mul(60 * 60)),
    };
    cfg.ready_timeout = Duration::from_secs(args.datastore_ready_timeout);
    cfg
}

fn load_config(args: &ServerArgs, data_dir: &Path) -> Result<ControlConfig> {
    let token = token::resolve(args.token.as_deref(), args.token_file.as_deref())?;
    if token.is_none() && args.server_url.as_deref().is_some_and(|u| !u.is_empty()) {
        bail!("--token is required when joining a cluster with --server");
    }
    let node_name = host::node_name(args.node_name.as_deref())?;
    Ok(control_config(args, &data_dir.join("server"), token, node_name))
}

/// `--name=value` for each `name=value` extra argument.
fn extra_args(extra: &[String]) -> impl Iterator<Item = String> + '_ {
    extra.iter().map(|arg| {
        if arg.starts_with("--") {
            arg.clone()
        } else {
            format!("--{arg}")
        }
    })
}

pub fn apiserver_args(args: &ServerArgs, cfg: &ControlConfig, etcd_servers: &[String]) -> Vec<String> {
    let mut out = vec![
        format!("--advertise-address={}", cfg.advertise_ip),
        format!("--bind-address={}", args.bind_address),
        format!("--secure-port={}", args.https_listen_port),
    ];
    if !etcd_servers.is_empty() {
        out.push(format!("--etcd-servers={}", etcd_servers.join(",")));
    }
    out.extend(extra_args(&args.kube_apiserver_arg));
    out
}

fn local_component_args(extra: &[String]) -> Vec<String> {
    let mut out = vec![
        "--bind-address=127.0.0.1".to_string(),
        "--profiling=false".to_string(),
    ];
    out.extend(extra_args(extra));
    out
}

async fn ping() -> &'static str {
    "pong"
}

fn supervisor_router() -> Router {
    Router::new().route("/ping", get(ping))
}

pub async fn run(args: ServerArgs, data_dir: PathBuf, cancel: CancellationToken) -> Result<()> {
    let cfg = load_config(&args, &data_dir)?;
    let registry = registry(&args);
    info!(
        "starting server {} in {}",
        cfg.node_name,
        cfg.data_dir.display()
    );

    let outcome = ClusterBootstrapper::new(&registry, cancel.clone())
        .bootstrap(&cfg, supervisor_router())
        .await
        .context("failed to start datastore")?;
    let (driver, router) = match outcome {
        BootstrapOutcome::Reset { driver } => {
            info!(
                "{} datastore reset, restart without --cluster-reset",
                driver.endpoint_name()
            );
            return Ok(());
        }
        BootstrapOutcome::Running { driver, router } => (driver, router),
    };

    let listener = TcpListener::bind((args.bind_address.as_str(), args.supervisor_port))
        .await
        .with_context(|| {
            format!(
                "failed to bind supervisor on {}:{}",
                args.bind_address, args.supervisor_port
            )
        })?;
    info!("supervisor listening on {}", listener.local_addr()?);
    let shutdown = cancel.clone();
    let api = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    if cfg.snapshot.disabled {
        info!("scheduled snapshots disabled");
    } else {
        tokio::spawn(snapshot_loop(
            driver.clone(),
            cfg.snapshot.interval,
            cancel.clone(),
        ));
    }

    let mut supervisor = Supervisor::new(cfg.data_dir.join("logs"));
    let result = match start_control_plane(&mut supervisor, &args, &cfg, driver.as_ref()) {
        Ok(()) => tokio::select! {
            _ = cancel.cancelled() => {
                info!("server shutting down");
                Ok(())
            }
            res = supervisor.wait_any() => res,
        },
        Err(e) => Err(e),
    };

    supervisor.shutdown().await;
    cancel.cancel();
    match api.await {
        Ok(Err(e)) => error!("supervisor API failed: {e}"),
        Err(e) => error!("supervisor API task failed: {e}"),
        Ok(Ok(())) => {}
    }
    result
}

fn start_control_plane(
    supervisor: &mut Supervisor,
    args: &ServerArgs,
    cfg: &ControlConfig,
    driver: &dyn Driver,
) -> Result<()> {
    let etcd_servers = driver.client_urls();
    if etcd_servers.is_empty() {
        warn!(
            "{} datastore exposes no etcd endpoint, pass --etcd-servers through --kube-apiserver-arg",
            driver.endpoint_name()
        );
    }
    supervisor.spawn("kube-apiserver", &apiserver_args(args, cfg, &etcd_servers))?;
    if args.disable_scheduler {
        info!("kube-scheduler disabled");
    } else {
        supervisor.spawn("kube-scheduler", &local_component_args(&args.kube_scheduler_arg))?;
    }
    supervisor.spawn(
        "kube-controller-manager",
        &local_component_args(&args.kube_controller_manager_arg),
    )?;
    Ok(())
}

async fn snapshot_loop(driver: Arc<dyn Driver>, every: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        match driver.snapshot().await {
            Ok(path) => info!("saved scheduled snapshot {}", path.display()),
            Err(DatastoreError::NotSupported { driver, .. }) => {
                warn!("{driver} datastore does not support snapshots, stopping schedule");
                return;
            }
            Err(e) => warn!("scheduled snapshot failed: {e}"),
        }
    }
}

/// `rkd snapshot save`: one snapshot of the local datastore.
pub async fn snapshot_save(args: ServerArgs, data_dir: PathBuf) -> Result<PathBuf> {
    let cfg = load_config(&args, &data_dir)?;
    let registry = registry(&args);
    let driver = registry.select(&cfg.datastore.endpoint)?;
    let _router = driver.register(&cfg, Router::new()).await?;
    if !driver.is_initialized(&cfg).await? {
        bail!(
            "no {} datastore found in {}",
            driver.endpoint_name(),
            cfg.data_dir.display()
        );
    }
    let path = driver
        .snapshot()
        .await
        .with_context(|| format!("{} snapshot failed", driver.endpoint_name()))?;
    Ok(path)
}
