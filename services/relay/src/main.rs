//! Transcribe relay
//!
//! Single-binary service that:
//! 1. Accepts media jobs over the admin API, with per-owner admission control
//! 2. Runs them on a bounded worker pool with fixed-delay retries
//! 3. Fetches each payload upstream through a pool of rotating credentials,
//!    quarantining rate-limited ones and disabling rejected ones

mod admin;
mod config;
mod error;
mod fetch;
mod http_connector;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use connector::{Connector, StaticConnector};
use dispatcher::Dispatcher;
use rotator::Rotator;
use session_auth::SessionStore;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::{Config, ConnectorKind};
use crate::fetch::{FetchProcessor, FetchSettings};
use crate::http_connector::HttpConnector;

/// Upper bound on draining in-flight admin requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting transcribe-relay");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.admin.listen_addr,
        upstream_url = %config.upstream.url,
        connector = ?config.rotator.connector,
        credentials = config.rotator.credentials.len(),
        workers = config.dispatcher.max_workers,
        "configuration loaded"
    );

    let client = reqwest::Client::new();

    let store = SessionStore::open(
        config.rotator.session_dir.clone(),
        config.rotator.session_cache_capacity,
    )
    .await
    .with_context(|| {
        format!(
            "failed to open session store at {}",
            config.rotator.session_dir.display()
        )
    })?;

    let connector: Arc<dyn Connector> = match config.rotator.connector {
        ConnectorKind::Static => Arc::new(StaticConnector::new()),
        ConnectorKind::Http => {
            let auth_url = config
                .rotator
                .auth_url
                .clone()
                .context("auth_url is required for the http connector")?;
            Arc::new(HttpConnector::new(client.clone(), auth_url))
        }
    };

    let rotator = Arc::new(Rotator::new(
        config.credentials(),
        connector,
        Arc::new(store),
    ));

    let processor = Arc::new(FetchProcessor::new(
        client,
        rotator.clone(),
        FetchSettings {
            upstream_url: config.upstream.url.clone(),
            timeout: Duration::from_secs(config.upstream.timeout_secs),
            max_attempts: config.upstream.max_attempts,
            max_wait: Duration::from_secs(config.upstream.max_wait_secs),
        },
    ));

    let dispatcher = Dispatcher::new(config.dispatcher_config());
    dispatcher.start().await;

    let mut background = Vec::new();
    if config.rotator.warm_interval_secs > 0 {
        background.push(rotator::spawn_warm_task(
            rotator.clone(),
            Duration::from_secs(config.rotator.warm_interval_secs),
        ));
    }
    if config.dispatcher.cleanup_interval_secs > 0 {
        background.push(dispatcher::spawn_cleanup_task(
            dispatcher.clone(),
            Duration::from_secs(config.dispatcher.cleanup_interval_secs),
            Duration::from_secs(config.dispatcher.job_max_age_secs),
        ));
    }

    let state = AdminState::new(
        dispatcher.clone(),
        rotator.clone(),
        processor,
        prometheus_handle,
    );
    let app = admin::build_router(state, config.admin.max_connections);

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("admin listener drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    for handle in background {
        handle.abort();
    }

    // Workers finish the job they are running; queued jobs are dropped
    dispatcher.stop().await;
    rotator.close_all().await;

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
