//! Tournament game-server reconciliation controller.
//!
//! Keeps per-round game servers on the cluster in sync with the schedule
//! stored in the league database: `run` drives the periodic reconciliation
//! loop, `delete` tears one server down and exits.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tourney_controller::chart::Renderer;
use tourney_controller::config::Config;
use tourney_controller::controller::{Controller, ReconcileWorker};
use tourney_controller::db::Database;

/// Tournament game-server reconciliation controller.
#[derive(Debug, Parser)]
#[command(name = "controller", version, about, long_about = None)]
struct Cli {
    /// Path to the kubeconfig file. Falls back to in-cluster configuration
    /// when unset or the path does not exist.
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the reconciliation loop.
    Run,

    /// Tear down the server for one match round and exit.
    Delete { match_id: i32, round_id: i32 },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap renders its own usage and help output.
            let _ = err.print();
            std::process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };

    if let Err(err) = run(cli).await {
        error!(error = %format!("{err:#}"), "Controller exited with error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = Config::from_env().context("load controller config")?;

    let client = load_kube_client(cli.kubeconfig.as_deref()).await?;

    let database = Database::connect(&cfg.database)
        .await
        .context("connect to postgres")?;

    let renderer = Renderer::new(
        client.clone(),
        &cfg.chart.path,
        &cfg.chart.values_file,
        &cfg.namespace,
    )
    .await
    .context("initialize chart renderer")?;

    let controller = Controller::new(cfg.clone(), database.repository(), client, renderer);

    match cli.command {
        Commands::Run => {
            // The sender stays alive in this scope so the worker's watch
            // channel cannot close while the loop is running.
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let signal_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = shutdown_signal().await {
                    error!(error = %err, "Failed to listen for signals");
                    return;
                }
                info!("Received termination signal");
                let _ = signal_tx.send(true);
            });

            ReconcileWorker::new(controller, cfg.poll_interval)
                .run(shutdown_rx)
                .await;
            Ok(())
        }
        Commands::Delete { match_id, round_id } => {
            controller
                .delete_server(match_id, round_id)
                .await
                .with_context(|| format!("delete server for match {match_id} round {round_id}"))?;
            println!("Deleted tournament server for match {match_id} round {round_id}");
            Ok(())
        }
    }
}

/// Loads cluster credentials from the kubeconfig path when it exists,
/// otherwise from the in-cluster environment.
async fn load_kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let path = match kubeconfig {
        Some(path) => Some(path.to_path_buf()),
        None => std::env::var_os("HOME")
            .map(|home| Path::new(&home).join(".kube").join("config")),
    };

    let config = match path.filter(|candidate| candidate.is_file()) {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(&path)
                .with_context(|| format!("read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("load kubeconfig")?
        }
        None => kube::Config::incluster().context("load in-cluster configuration")?,
    };

    Client::try_from(config).context("create cluster client")
}

async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal;

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}
