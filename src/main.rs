use clap::Parser;
use glance_image_sync::monitoring::LoopStats;
use glance_image_sync::{Config, HttpServer, ImageSyncPipeline, RunMode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "glance-image-sync",
    about = "Relay image notifications between image nodes and replicate image files",
    version
)]
struct Cli {
    /// Which loops to run
    #[arg(long, value_enum, env = "ACTION", default_value_t = RunMode::Both)]
    action: RunMode,
}

fn init_tracing(
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| format!("Log file path {} has no file name", path.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "glance_image_sync=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

type PipelineTask = JoinHandle<glance_image_sync::Result<LoopStats>>;

/// Wait for a stopped pipeline to finish. Past `timeout` the task is aborted
/// and the shutdown counts as failed.
async fn wait_for_shutdown(
    handle: &mut PipelineTask,
    timeout: Duration,
) -> Result<Result<glance_image_sync::Result<LoopStats>, JoinError>, String> {
    match tokio::time::timeout(timeout, &mut *handle).await {
        Ok(result) => Ok(result),
        Err(_) => {
            handle.abort();
            Err(format!(
                "Pipeline did not stop within {}s; aborted with work still in flight",
                timeout.as_secs()
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration first so the log file setting can be honoured
    let config = Config::from_env();
    let log_file = config.as_ref().ok().and_then(|c| c.sync_log_file.clone());
    let _log_guard = init_tracing(log_file.as_deref())?;

    info!("Starting glance image sync ({})", cli.action.as_str());

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {e}");
        e
    })?;

    config.validate().map_err(|e| {
        error!("Configuration validation failed: {e}");
        e
    })?;

    info!("Configuration loaded successfully");
    info!("Hostname: {}", config.hostname);
    info!("API nodes: {:?}", config.api_nodes.iter().collect::<Vec<_>>());
    info!("Image datadir: {}", config.datadir.display());
    info!(
        "Exchange: {}, topic: {}, relay prefix: {}",
        config.exchange, config.topic, config.relay_prefix
    );

    let pipeline = Arc::new(
        ImageSyncPipeline::connect(config.clone(), cli.action)
            .await
            .map_err(|e| {
                error!("Failed to connect pipeline: {e}");
                e
            })?,
    );

    // Start HTTP server for health checks and metrics
    let http_server = HttpServer::new(pipeline.clone(), config.http_port);
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.start().await {
            error!("HTTP server error: {e}");
        }
    });

    let mut pipeline_handle = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.start().await }
    });

    let result = tokio::select! {
        result = &mut pipeline_handle => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received Ctrl-C, initiating graceful shutdown...");
            pipeline.stop();

            info!("Waiting up to {}s for in-flight work to complete...", config.shutdown_timeout_secs);
            match wait_for_shutdown(
                &mut pipeline_handle,
                Duration::from_secs(config.shutdown_timeout_secs),
            )
            .await
            {
                Ok(result) => result,
                Err(e) => {
                    error!("{e}");
                    http_handle.abort();
                    return Err(e.into());
                }
            }
        }
    };

    http_handle.abort();

    match result {
        Ok(Ok(stats)) => {
            info!(
                "Pipeline shut down gracefully ({} notifications processed)",
                stats.processed
            );
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Pipeline error: {e}");
            Err(e.into())
        }
        Err(e) => {
            error!("Pipeline task panicked: {e}");
            Err(e.into())
        }
    }
}
