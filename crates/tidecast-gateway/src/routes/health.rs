//! Health check endpoint.

use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use tokio::time::timeout;
use tracing::warn;

use crate::json::HealthResponse;
use crate::AppState;

/// Path of the health check.
pub const HEALTH_PATH: &str = "/health";

/// How long the broker has to answer a stats request.
pub const STATS_TIMEOUT: Duration = Duration::from_secs(1);

/// Health check routes.
pub fn routes() -> Router<AppState> {
    Router::new().route(HEALTH_PATH, get(health_check))
}

/// Health check handler.
///
/// Reports `degraded` when the broker is gone, and also when it is running
/// but stuck, e.g. blocked on a subscriber that stopped reading.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (broker_running, stats) = match timeout(STATS_TIMEOUT, state.broker.stats()).await {
        Ok(Ok(stats)) => (true, Some(stats)),
        Ok(Err(_)) => (false, None),
        Err(_) => {
            warn!(
                timeout_ms = STATS_TIMEOUT.as_millis() as u64,
                "broker did not answer stats request"
            );
            (true, None)
        }
    };

    Json(HealthResponse {
        status: if stats.is_some() { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        broker_running,
        stats,
    })
}
