//! Queue statistics and the admin HTTP surface (health, readiness, stats,
//! Prometheus metrics).

use crate::error::QueueError;
use crate::job::JobClass;
use crate::metrics::render_metrics;
use crate::system::JobSystem;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-class queue counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassStats {
    /// Pending jobs eligible for pickup now.
    pub waiting: u64,
    /// Jobs currently claimed by a worker.
    pub active: u64,
    /// Terminal successes (monotonic counter).
    pub completed: u64,
    /// Terminal failures (monotonic counter).
    pub failed: u64,
    /// Pending jobs scheduled in the future (delays and backoff).
    pub delayed: u64,
}

/// Stats for one class, flattened for the admin endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassStatsSnapshot {
    pub class: JobClass,
    #[serde(flatten)]
    pub counts: ClassStats,
}

/// Aggregate stats across all classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub classes: Vec<ClassStatsSnapshot>,
}

impl SystemStats {
    pub fn total_waiting(&self) -> u64 {
        self.classes.iter().map(|c| c.counts.waiting).sum()
    }

    pub fn total_active(&self) -> u64 {
        self.classes.iter().map(|c| c.counts.active).sum()
    }
}

/// Shared state for the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub system: Arc<JobSystem>,
    pub app_name: &'static str,
    pub app_version: &'static str,
}

/// Admin router: `/health`, `/ready`, `/stats`, `/metrics`.
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.app_name,
        "version": state.app_version,
    }))
}

async fn ready(State(state): State<AdminState>) -> impl IntoResponse {
    match state.system.ping().await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ready" })),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "error": err.to_string(),
            })),
        ),
    }
}

async fn stats(State(state): State<AdminState>) -> Result<Json<SystemStats>, AdminError> {
    let stats = state.system.stats().await?;
    Ok(Json(stats))
}

async fn metrics() -> impl IntoResponse {
    render_metrics()
}

struct AdminError(QueueError);

impl From<QueueError> for AdminError {
    fn from(err: QueueError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> axum::response::Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}
