//! JSON response types for the HTTP gateway.

use serde::Serialize;
use tidecast_core::BrokerStats;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Health status.
    pub status: String,
    /// Gateway version.
    pub version: String,
    /// Whether the broker control loop is answering.
    pub broker_running: bool,
    /// Broker counters, absent when the broker is gone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<BrokerStats>,
}
