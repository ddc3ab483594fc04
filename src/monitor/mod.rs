//! Read-only HTTP monitoring surface.
//!
//! - `GET /api/health`: liveness, version, uptime
//! - `GET /api/stats`: worker counters and queue depths
//! - `GET /api/registry`: capability registry status

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::queue::QueueService;
use crate::registry::{CapabilityRegistry, RegistryStatus};
use crate::worker::WorkerStats;

#[derive(Clone)]
pub struct MonitorState {
    pub queue: QueueService,
    pub stats: Arc<WorkerStats>,
    pub registry: Option<Arc<CapabilityRegistry>>,
    pub worker_ids: Vec<String>,
    started_at: Instant,
}

impl MonitorState {
    pub fn new(
        queue: QueueService,
        stats: Arc<WorkerStats>,
        registry: Option<Arc<CapabilityRegistry>>,
        worker_ids: Vec<String>,
    ) -> Self {
        Self {
            queue,
            stats,
            registry,
            worker_ids,
            started_at: Instant::now(),
        }
    }
}

/// A running monitor server.
pub struct Monitor {
    pub addr: SocketAddr,
    pub handle: JoinHandle<()>,
}

pub fn router(state: MonitorState) -> Router {
    let api = Router::new()
        .route("/health", get(api_health))
        .route("/stats", get(api_stats))
        .route("/registry", get(api_registry));
    Router::new().nest("/api", api).with_state(state)
}

/// Bind `addr` and serve the monitor routes in a background task.
pub async fn start_monitor(addr: SocketAddr, state: MonitorState) -> std::io::Result<Monitor> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    let app = router(state);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("monitor server error: {e}");
        }
    });

    info!(%bound_addr, "monitor started");
    Ok(Monitor {
        addr: bound_addr,
        handle,
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn api_health(State(state): State<MonitorState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "workers": state.worker_ids.len(),
    }))
}

async fn api_stats(State(state): State<MonitorState>) -> impl IntoResponse {
    let workers = state.stats.snapshot();
    match state.queue.depths().await {
        Ok(depths) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "worker_ids": state.worker_ids,
                "workers": workers,
                "queue": depths,
            })),
        ),
        Err(e) => {
            warn!(error = %e, "queue depth lookup failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "worker_ids": state.worker_ids,
                    "workers": workers,
                    "error": format!("store unavailable: {e}"),
                })),
            )
        }
    }
}

async fn api_registry(State(state): State<MonitorState>) -> impl IntoResponse {
    let status = state
        .registry
        .as_ref()
        .map(|r| r.status())
        .unwrap_or_else(RegistryStatus::default);
    Json(status)
}
