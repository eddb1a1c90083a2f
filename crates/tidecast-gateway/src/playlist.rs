//! Route registry: request paths mapped to event filters.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use tidecast_core::{
    start_ingest, Broker, BrokerConfig, Connection, Filter, IngestSummary, TailOptions,
};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::routes;
use crate::AppState;

/// Streaming routes and their filters.
///
/// Adding the same path twice keeps the last filter.
#[derive(Debug, Clone, Default)]
pub struct Playlist {
    routes: HashMap<String, Filter>,
}

/// A running playlist.
pub struct Playback {
    /// HTTP router serving every added route.
    pub router: Router,
    /// Broker shared by all sessions.
    pub broker: Broker,
    /// Ingestion task feeding the broker.
    pub ingest: JoinHandle<IngestSummary>,
}

impl Playlist {
    /// Create an empty playlist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream events passing `filter` on `path`.
    pub fn add(mut self, path: impl Into<String>, filter: Filter) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if self.routes.insert(path.clone(), filter).is_some() {
            debug!(path = %path, "route replaced");
        }
        self
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes were added.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Added paths, in no particular order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Build the router for these routes.
    ///
    /// `/health` is served unless a route claims that path.
    pub fn router(&self, state: AppState) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let mut router = Router::new();
        if !self.routes.contains_key(routes::health::HEALTH_PATH) {
            router = router.merge(routes::health::routes());
        }
        for (path, filter) in &self.routes {
            router = router.route(path, routes::stream::handler(path.clone(), filter.clone()));
        }

        router
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(state)
    }

    /// Start the broker, begin tailing `connection` and build the router.
    pub fn play(
        self,
        connection: Arc<dyn Connection>,
        options: TailOptions,
        config: BrokerConfig,
    ) -> Playback {
        let broker = Broker::start(config);
        let ingest = start_ingest(connection.as_ref(), options, broker.clone());
        let router = self.router(AppState::new(broker.clone(), connection));

        info!(routes = self.routes.len(), "playlist started");

        Playback {
            router,
            broker,
            ingest,
        }
    }
}
