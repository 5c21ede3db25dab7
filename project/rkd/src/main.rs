use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use rkd::assets::Assets;
use rkd::cli::{self, Cli, Commands, SnapshotCommand};
use rkd::datadir::GLOBAL_DATA_DIR;
use rkd::staging::StagingManager;
use rkd::{agent, config, launch, server};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

fn main() -> ExitCode {
    let argv: Vec<OsString> = env::args_os().collect();

    let result = match cli::tool_invocation(&argv) {
        Some((tool, args)) => {
            init_tracing(false);
            run_tool(None, tool, &args)
        }
        None => match config::expand_args(argv) {
            Ok(argv) => {
                let cli = Cli::parse_from(argv);
                init_tracing(cli.debug);
                run(cli)
            }
            Err(e) => {
                init_tracing(false);
                Err(e)
            }
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default.into())
                .from_env_lossy()
                .add_directive("sqlx=warn".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn run(cli: Cli) -> Result<()> {
    if let Some((tool, args)) = cli.command.tool() {
        return run_tool(cli.data_dir.as_deref(), tool, args);
    }

    let staging = StagingManager::new(Assets::load()?);
    let data_dir = staging.resolve(cli.data_dir.as_deref())?;
    let active = staging
        .extract(&data_dir)
        .context("failed to stage bundled binaries")?;
    launch::export_staged_env(&active)?;
    info!("using binaries from {}", active.display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Commands::Server(args) => server::run(args, data_dir, shutdown_token()).await,
            Commands::Agent(args) => agent::run(args, data_dir, shutdown_token()).await,
            Commands::Snapshot(SnapshotCommand::Save(args)) => {
                let path = server::snapshot_save(args, data_dir).await?;
                println!("{}", path.display());
                Ok(())
            }
            Commands::Kubectl(_) | Commands::Crictl(_) | Commands::Ctr(_) | Commands::CheckConfig(_) => {
                unreachable!("tools are handled before the runtime starts")
            }
        }
    })
}

/// Stage the bundle and replace this process with `tool`.
fn run_tool(data_dir: Option<&Path>, tool: &str, args: &[OsString]) -> Result<()> {
    let staging = StagingManager::new(Assets::load()?);
    let data_dir = staging.resolve(data_dir)?;
    let active = staging
        .extract(&data_dir)
        .context("failed to stage bundled binaries")?;

    if tool == "crictl" && env::var_os("CRI_CONFIG_FILE").is_none() {
        let crictl_config = PathBuf::from(GLOBAL_DATA_DIR).join("agent/etc/crictl.yaml");
        // SAFETY: no other threads exist yet; the process is about to exec.
        unsafe { env::set_var("CRI_CONFIG_FILE", crictl_config) };
    }

    let never = launch::exec(&active, tool, args).with_context(|| format!("failed to run {tool}"))?;
    match never {}
}

/// Cancelled on Ctrl-C or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received, shutting down");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!("failed to listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
