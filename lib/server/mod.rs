pub mod monitoring;
use crate::state::AppState;
use prometheus_client::encoding::text::encode;

use axum::{extract::State, routing::get, Router};
use monitoring::REPAIR_METRICS;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

async fn health_handler() -> &'static str {
    "Healthy"
}

async fn expose_metrics(state: State<Arc<AppState>>) -> String {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    if let Err(err) = encode(&mut buffer, &registry) {
        error!(event = "metrics_encode_failed", error = %err, "could not encode metrics");
    }
    buffer
}

/// Requests a cooperative stop of the repair loop. Always answers `OK`, however often it is hit.
async fn stop_handler(state: State<Arc<AppState>>) -> &'static str {
    let already_requested = state.stop.is_stop_requested();
    state.stop.request_stop();
    if let Some(metrics) = REPAIR_METRICS.get() {
        metrics.stop_requested.set(1);
    }
    if !already_requested {
        info!(
            event = "repair_stop_requested",
            source = "http",
            "stop requested; the loop exits after the current fragment"
        );
    }
    "OK"
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "ring_repair" }))
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .route("/repair/stop", get(stop_handler).post(stop_handler))
        .with_state(state)
}

/// Registers metrics and starts the control/metrics HTTP server on `addr`.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    {
        let mut registry = state.registry.write().await;

        REPAIR_METRICS
            .get_or_init(|| async { monitoring::RepairMetrics::register(&mut registry, "repair") })
            .await;

        monitoring::register_build_info_metric(&mut registry, "worker");
    }

    let shutdown_token = state.shutdown_token.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = served {
            error!(event = "control_server_failed", error = %err, "control server exited");
        }
    });

    Ok(server_handle)
}
