//! vastmux - fleet-aware OpenAI-compatible proxy daemon.
//!
//! Wires configuration → control-plane watcher → fleet manager → balancer →
//! HTTP server, and runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};
use tracing_subscriber::EnvFilter;
use vastmux::backend::gpu::GpuUpdate;
use vastmux::{
    Balancer, Config, ControlPlaneClient, FleetManager, FleetWatcher, ProxyState, StickyStats,
    SupervisorConfig, ssh_tunnel_factory, telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "vastmux")]
#[command(about = "Fleet-aware OpenAI-compatible proxy for rented GPU instances")]
struct Args {
    /// Control-plane API key
    #[arg(long, env = "VAST_API_KEY", hide_env_values = true)]
    api_key: String,

    /// SSH private key for instance tunnels
    #[arg(long, env = "SSH_KEY_PATH", default_value = "~/.ssh/id_rsa")]
    key_path: PathBuf,

    /// Address the proxy listens on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Label written to claimed instances; "none" disables labelling
    #[arg(long, env = "VASTMUX_LABEL", default_value = "vastmux")]
    label: String,

    /// Control-plane poll interval in seconds
    #[arg(long, env = "VASTMUX_POLL_SECS", default_value = "10")]
    poll_secs: u64,

    /// Supervisor tick interval in seconds
    #[arg(long, env = "VASTMUX_HEALTH_SECS", default_value = "5")]
    health_secs: u64,

    /// Minimum seconds between tunnel upgrade attempts
    #[arg(long, env = "VASTMUX_UPGRADE_SECS", default_value = "30")]
    upgrade_secs: u64,

    /// Prometheus metrics port (0 disables)
    #[arg(long, env = "VASTMUX_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            api_key: self.api_key,
            key_path: self.key_path,
            listen_addr: self.listen,
            managed_label: Config::parse_label(&self.label),
            poll_interval: Duration::from_secs(self.poll_secs),
            health_interval: Duration::from_secs(self.health_secs),
            upgrade_interval: Duration::from_secs(self.upgrade_secs),
            metrics_port: self.metrics_port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present, matching the operator workflow.
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("vastmux=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = args.into_config();
    info!(
        listen = %config.listen_addr,
        label = config.managed_label.as_deref().unwrap_or("(disabled)"),
        "starting vastmux"
    );

    // Metrics exporter on its own port.
    if let Some(handle) = telemetry::install()
        && config.metrics_port != 0
    {
        let addr = format!("0.0.0.0:{}", config.metrics_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind metrics to {addr}"))?;
        info!(addr = %addr, "serving metrics");
        let router = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "metrics server error");
            }
        });
    }

    let cancel = CancellationToken::new();

    // Core components.
    let control = ControlPlaneClient::new(config.api_key.clone());
    let watcher = Arc::new(FleetWatcher::new(control.clone(), config.poll_interval));
    let balancer = Arc::new(Balancer::new());
    let sticky = Arc::new(StickyStats::new(Duration::from_secs(60)));
    let (gpu_tx, mut gpu_rx) = mpsc::channel::<GpuUpdate>(64);

    // Stand-in for the UI collaborator: drain the metrics sink so updates
    // stay observable in logs.
    tokio::spawn(async move {
        while let Some(update) = gpu_rx.recv().await {
            trace!(
                instance = update.instance_id,
                gpus = update.gpus.len(),
                "gpu update"
            );
        }
    });

    // Subscribe before the watcher starts so no `added` is missed.
    let events = watcher.subscribe();
    let manager = FleetManager::new(
        Arc::clone(&watcher),
        Arc::clone(&balancer),
        control,
        ssh_tunnel_factory(),
        SupervisorConfig {
            tick: config.health_interval,
            upgrade_interval: config.upgrade_interval,
            managed_label: config.managed_label.clone(),
            key_path: config.key_path.clone(),
        },
        gpu_tx,
    );
    let manager_cancel = cancel.clone();
    let manager_task = tokio::spawn(async move { manager.run(events, manager_cancel).await });

    let watcher_task = {
        let watcher = Arc::clone(&watcher);
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.run(cancel).await })
    };

    // Client-facing proxy.
    let app = vastmux::proxy::router(ProxyState::new(Arc::clone(&balancer), sticky));
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening for requests");

    // Ctrl-C cancels everything.
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("server error")?;

    // Let supervisors close their tunnels before exiting.
    cancel.cancel();
    let _ = manager_task.await;
    let _ = watcher_task.await;

    Ok(())
}
