mod backoff;
mod cli_config;
mod heal;
mod logging;
mod metrics;
mod monitor;
mod runtime;
mod state;

use crate::cli_config::{Args, Config};
use crate::heal::Healer;
use crate::logging::{effective_level, setup_logging};
use crate::metrics::MetricsState;
use crate::monitor::{ContainerMonitor, HEAL_QUEUE_CAPACITY};
use crate::runtime::{DockerGateway, RuntimeGateway};
use crate::state::{ContainerRegistry, PatientRegistry};

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

// =============================================================================
// Main Application
// =============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configuration first: debug_mode decides the log level
    let config = Config::load(args.config.as_deref())?;

    let level = effective_level(&args.log_level, config.debug_mode);
    let _guard = setup_logging(&args.log_dir, level, args.log_format)?;

    info!("Starting Docker container manager");
    info!(
        "Log dir: {}, config: {}",
        args.log_dir.display(),
        args.config
            .as_deref()
            .map_or_else(|| "<environment>".to_string(), |p| p.display().to_string())
    );

    let gateway = DockerGateway::connect(&config.docker_socket)
        .with_context(|| format!("Can't connect to docker daemon at {}", config.docker_socket))?;
    // The daemon version is not expected to change while we run
    let version = gateway
        .version()
        .await
        .context("Can't get docker version")?;
    let gateway = Arc::new(gateway);

    info!("Docker daemon version: {}", version.full);
    info!("Docker socket path: {}", config.docker_socket);
    info!(
        "Scrape interval: {:?}, inspect timeout: {:?}, cleanup interval: {:?}",
        config.scrape_interval, config.inspect_timeout, config.cleanup_interval
    );
    info!(
        "Heal mode: {}, restart backoff: {:?}..{:?}",
        config.heal_mode, config.restart_backoff_min, config.restart_backoff_max
    );

    let containers = ContainerRegistry::new();
    let patients = PatientRegistry::new();
    let (heal_tx, heal_rx) = mpsc::channel(HEAL_QUEUE_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = Arc::new(ContainerMonitor::new(
        config.clone(),
        Arc::clone(&gateway),
        containers.clone(),
        patients.clone(),
    ));

    let mut handles = Vec::new();

    handles.push(tokio::spawn({
        let monitor = Arc::clone(&monitor);
        let shutdown = shutdown_rx.clone();
        async move { monitor.run_scrape_loop(heal_tx, shutdown).await }
    }));

    handles.push(tokio::spawn({
        let monitor = Arc::clone(&monitor);
        let shutdown = shutdown_rx.clone();
        async move { monitor.run_status_loop(shutdown).await }
    }));

    if config.heal_mode {
        let healer = Healer::new(
            Arc::clone(&gateway),
            containers.clone(),
            patients.clone(),
            config.inspect_timeout,
        );
        handles.push(tokio::spawn(healer.run(heal_rx, shutdown_rx.clone())));

        handles.push(tokio::spawn({
            let monitor = Arc::clone(&monitor);
            let shutdown = shutdown_rx.clone();
            async move { monitor.run_reaper_loop(shutdown).await }
        }));
    }

    let router = metrics::router(MetricsState {
        containers,
        version: Arc::new(version),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint on {addr}"))?;

    info!("Starting http server on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("Metrics server failed")?;

    // The healer only returns once its in-flight treatments are done
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task failed");
        }
    }

    info!("Docker container manager stopped");
    Ok(())
}
