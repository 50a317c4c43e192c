use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::core::ImageSyncPipeline;
use crate::monitoring::Metrics;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Health and metrics endpoints for a running pipeline.
pub struct HttpServer {
    pipeline: Arc<ImageSyncPipeline>,
    port: u16,
}

impl HttpServer {
    pub fn new(pipeline: Arc<ImageSyncPipeline>, port: u16) -> Self {
        Self { pipeline, port }
    }

    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let routes = health_route(self.pipeline.clone())
            .or(metrics_json_route(self.pipeline.clone()))
            .or(prometheus_route());

        info!("Serving /health and /metrics on port {}", self.port);
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;

        Ok(())
    }
}

fn with_pipeline(
    pipeline: Arc<ImageSyncPipeline>,
) -> impl Filter<Extract = (Arc<ImageSyncPipeline>,), Error = Infallible> + Clone {
    warp::any().map(move || pipeline.clone())
}

fn health_route(
    pipeline: Arc<ImageSyncPipeline>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("health")
        .and(warp::get())
        .and(with_pipeline(pipeline))
        .then(|pipeline: Arc<ImageSyncPipeline>| async move {
            let health = pipeline.health().await;
            let status = if health.healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(warp::reply::json(&health), status)
        })
}

/// `/metrics/json`: the pipeline state plus the counters kept in-process.
fn metrics_json_route(
    pipeline: Arc<ImageSyncPipeline>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("metrics" / "json")
        .and(warp::get())
        .and(with_pipeline(pipeline))
        .then(|pipeline: Arc<ImageSyncPipeline>| async move {
            let health = pipeline.health().await;
            let snapshot = pipeline.metrics.get_snapshot().await;
            warp::reply::json(&json!({
                "mode": health.mode,
                "running": health.running,
                "rabbitmq_healthy": health.rabbitmq_healthy,
                "notifications_consumed": snapshot.notifications_consumed,
                "notifications_skipped": snapshot.notifications_skipped,
                "fanout_publishes": snapshot.fanout_publishes,
                "fanout_failures": snapshot.fanout_failures,
                "transfers_succeeded": snapshot.transfers_succeeded,
                "transfers_failed": snapshot.transfers_failed,
                "deletes": snapshot.deletes,
                "deletes_deferred": snapshot.deletes_deferred,
                "uptime_seconds": snapshot.uptime_seconds,
                "last_event_time": snapshot.last_event_time,
                "last_check": health.last_check
            }))
        })
}

fn prometheus_route() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("metrics").and(warp::get()).map(prometheus_reply)
}

fn prometheus_reply() -> warp::reply::Response {
    match Metrics::get_prometheus_metrics() {
        Ok(text) => warp::reply::with_header(text, "content-type", PROMETHEUS_CONTENT_TYPE)
            .into_response(),
        Err(e) => {
            error!("Failed to encode Prometheus metrics: {}", e);
            warp::reply::with_status(
                "metrics unavailable".to_string(),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
            .into_response()
        }
    }
}
