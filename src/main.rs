//! Session Gateway - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use session_gateway::{
    Gateway, ProcessFactory, SessionReaper, api, config::GatewayConfig, metrics,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "session-gateway")]
#[command(about = "Session-multiplexing gateway for upstream protocol servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Override idle session timeout (seconds)
    #[arg(long)]
    session_idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting Session Gateway");

    // Load configuration
    let mut config = GatewayConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }
    if let Some(timeout) = cli.session_idle_timeout {
        config.session_idle_timeout_secs = Some(timeout);
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        endpoints = config.endpoints.len(),
        namespaces = config.namespaces.len(),
        api_keys = config.api_keys.len(),
        session_idle_timeout_secs = ?config.session_idle_timeout_secs,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    let factory = Arc::new(ProcessFactory::new(
        config.namespaces.iter().cloned(),
        config.upstream_shutdown_timeout(),
    ));
    let gateway = Arc::new(Gateway::from_config(&config, factory));
    let sessions = gateway.sessions().clone();

    // Start idle session reaper
    let reaper_handle = config.session_idle_timeout().map(|idle_timeout| {
        let reaper = Arc::new(SessionReaper::new(
            sessions.clone(),
            config.reaper_interval(),
            idle_timeout,
        ));
        tokio::spawn(reaper.run())
    });

    // Setup API
    let app_state = api::AppState {
        gateway: gateway.clone(),
        prometheus_handle,
        sse_keep_alive: config.sse_keepalive(),
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Open event streams only finish once their sessions end, so sessions
    // are ended before the server waits for in-flight connections.
    let shutdown_sessions = sessions.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!(
                active_sessions = shutdown_sessions.count(),
                "Ending all sessions"
            );
            shutdown_sessions.end_all().await;
        })
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    // Sessions begun while the first pass ran
    sessions.end_all().await;

    if let Some(handle) = reaper_handle {
        handle.abort();
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
