use anyhow::{Context, Result};
use slicer_service::api::{start_api_server, AppState};
use slicer_service::decoder::{DecoderSettings, FfmpegDecoder};
use slicer_service::{Config, Orchestrator, PipelineSettings, StorageBackend};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        "Starting slicer service"
    );

    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    let backend = StorageBackend::from_config(&config)
        .await
        .context("Failed to initialize storage backend")?;

    let decoder = Arc::new(FfmpegDecoder::new(DecoderSettings::from(&config.decoder)));
    info!(
        ffmpeg = %config.decoder.ffmpeg_path,
        frame_rate = config.decoder.frame_rate,
        "Decoder configured"
    );

    let orchestrator = Arc::new(Orchestrator::new(
        decoder,
        backend,
        PipelineSettings::from(&config),
    ));

    let api_state = AppState { orchestrator };

    if let Err(e) = start_api_server(api_state, &config.api, shutdown_signal()).await {
        error!(error = %e, "API server error");
        return Err(e);
    }

    info!("Slicer service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
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
            info!("Received Ctrl+C signal, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM signal, shutting down");
        }
    }
}
