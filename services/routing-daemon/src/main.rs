//! Routing daemon entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

use lbr_routing_daemon::bus::StompBus;
use lbr_routing_daemon::config::{Config, DEFAULT_CONFIG_PATH};
use lbr_routing_daemon::daemon::Daemon;
use lbr_routing_daemon::router::EventRouter;
use lbr_routing_daemon::{build_controller, logging};

/// Keeps a load balancer in step with application lifecycle events.
#[derive(Debug, Parser)]
#[command(name = "routing-daemon", version)]
struct Cli {
    /// Configuration file.
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("invalid configuration in {}", cli.config.display()))?;

    if cli.check {
        println!("{}: configuration ok", cli.config.display());
        return Ok(());
    }

    logging::init(&config.log).context("failed to initialize logging")?;

    info!(
        config = %cli.config.display(),
        backend = config.backend.model.name(),
        strategy = %config.backend.strategy,
        broker = ?config.broker.hosts.iter().map(ToString::to_string).collect::<Vec<_>>(),
        destination = %config.broker.destination,
        "Starting routing daemon"
    );

    let controller = build_controller(&config.backend).context("failed to open backend")?;
    let mut router = EventRouter::new(controller, config.router.clone());
    router.log_inventory().await;

    let bus = match StompBus::connect(&config.broker).await {
        Ok(bus) => bus,
        Err(e) => {
            error!(error = %e, "Connecting to message broker failed");
            return Err(e).context("failed to connect to message broker");
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    });

    Daemon::new(bus, router, config.update_interval)
        .run(shutdown_rx)
        .await;

    info!("Routing daemon stopped");
    Ok(())
}
