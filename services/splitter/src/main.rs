use anyhow::{Context, Result};
use chrono::Utc;
use splitter::api::{start_api_server, AppState};
use splitter::attachment_host;
use splitter::config::Config;
use splitter::{DeletionCoordinator, PartRegistry, RendezvousBroker, UploadIssuer, UploaderSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        part_size_bytes = config.upload.part_size_bytes,
        batch_size = config.upload.batch_size,
        "Starting Splitter Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let registry = Arc::new(
        PartRegistry::new(&config.database)
            .await
            .context("Failed to initialize part registry")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        registry
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let host = attachment_host::from_config(&config.host)
        .await
        .context("Failed to initialize attachment host")?;

    if let Some(ref spool_dir) = config.upload.spool_dir {
        tokio::fs::create_dir_all(spool_dir)
            .await
            .with_context(|| format!("Failed to create spool directory {}", spool_dir.display()))?;
    }

    let shutdown = CancellationToken::new();
    let broker = Arc::new(RendezvousBroker::new(registry.clone(), config.token_lifespan()));
    let deletion = Arc::new(DeletionCoordinator::new(host.clone(), registry.clone()));
    let issuer = UploadIssuer::new(
        broker.clone(),
        registry.clone(),
        host.clone(),
        &config.api.webapp_url,
        config.completion_timeout(),
        shutdown.child_token(),
    );

    // Create API state
    let api_state = AppState {
        registry: registry.clone(),
        broker: broker.clone(),
        host,
        deletion,
        issuer,
        uploader: UploaderSettings::from(&config.upload),
        trigger_key: config.api.trigger_key.clone(),
    };

    // Spawn pending upload sweeper
    let sweeper_handle = tokio::spawn(sweep_pending_uploads(
        broker,
        config.sweep_interval(),
        shutdown.child_token(),
    ));

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.child_token();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Splitter service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down splitter service");

    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(10), api_handle).await.is_err() {
        error!("API server did not stop in time");
    }
    sweeper_handle.abort();
    registry.pool().close().await;

    info!("Splitter service stopped");

    Ok(())
}

/// Periodically drop pending uploads whose token expired unused
async fn sweep_pending_uploads(broker: Arc<RendezvousBroker>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let swept = broker.sweep_expired(Utc::now().timestamp_millis());
                if !swept.is_empty() {
                    metrics::counter!("splitter.uploads.expired").increment(swept.len() as u64);
                }
            }
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
