//! tidecast HTTP gateway.
//!
//! Serves change events to browsers and other HTTP clients as Server-Sent
//! Events. Each route of a [`Playlist`] streams the events passing its filter.

pub mod config;
pub mod error;
pub mod json;
pub mod playlist;
pub mod routes;

pub use config::{Args, GatewayConfig, RouteSpec};
pub use error::AppError;
pub use playlist::{Playback, Playlist};

use std::sync::Arc;

use tidecast_core::{Broker, Connection};

/// Application state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// Broker shared by all sessions.
    pub broker: Broker,
    /// Upstream connection; each session holds a copy.
    pub connection: Arc<dyn Connection>,
}

impl AppState {
    /// Create new application state.
    pub fn new(broker: Broker, connection: Arc<dyn Connection>) -> Self {
        Self { broker, connection }
    }
}
