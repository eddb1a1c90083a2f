//! Gateway configuration.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use tidecast_core::broker::{DEFAULT_PUBLISH_BUFFER, DEFAULT_SUBSCRIBER_BUFFER};
use tidecast_core::source::DEFAULT_CHANNEL_SIZE;
use tidecast_core::{BrokerConfig, Filter, OverflowPolicy, TailOptions};

use crate::playlist::Playlist;

/// Route served when none is configured.
pub const DEFAULT_ROUTE: &str = "/events";

/// tidecast gateway command line arguments.
#[derive(Debug, Parser)]
#[command(name = "tidecast-gateway")]
#[command(about = "Server-Sent Events gateway for change feeds")]
pub struct Args {
    /// Address to listen on for HTTP requests.
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// File of newline-delimited JSON operations. Reads stdin when unset.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Streaming route as PATH or PATH=NAMESPACE. Repeatable.
    #[arg(short, long = "route", value_name = "PATH[=NAMESPACE]")]
    pub routes: Vec<RouteSpec>,

    /// Only ingest operations from this namespace. Repeatable.
    #[arg(long = "namespace", value_name = "NAMESPACE")]
    pub namespaces: Vec<String>,

    /// Only ingest operations with a timestamp after this one.
    #[arg(long)]
    pub after: Option<u64>,

    /// Capacity of the broker's publish queue.
    #[arg(long, default_value_t = DEFAULT_PUBLISH_BUFFER)]
    pub publish_buffer: usize,

    /// Capacity of each subscriber's delivery queue.
    #[arg(long, default_value_t = DEFAULT_SUBSCRIBER_BUFFER)]
    pub subscriber_buffer: usize,

    /// What to do when a subscriber's queue is full (block, drop-event, disconnect).
    #[arg(long, default_value_t = OverflowPolicy::Block)]
    pub overflow: OverflowPolicy,

    /// Capacity of the change feed channels.
    #[arg(long, default_value_t = DEFAULT_CHANNEL_SIZE)]
    pub channel_size: usize,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// A streaming route and the namespace it is restricted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    /// Request path.
    pub path: String,
    /// Namespace filter; `None` lets everything through.
    pub namespace: Option<String>,
}

impl RouteSpec {
    /// A route that lets every event through.
    pub fn allow_all(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            namespace: None,
        }
    }

    /// Filter for this route.
    pub fn filter(&self) -> Filter {
        match &self.namespace {
            Some(namespace) => Filter::namespace(namespace.clone()),
            None => Filter::allow_all(),
        }
    }
}

impl FromStr for RouteSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, namespace) = match s.split_once('=') {
            Some((path, namespace)) => (path, Some(namespace)),
            None => (s, None),
        };
        if !path.starts_with('/') {
            return Err(format!("route path must start with '/': {}", path));
        }
        if namespace.is_some_and(str::is_empty) {
            return Err(format!("empty namespace for route {}", path));
        }
        Ok(Self {
            path: path.to_string(),
            namespace: namespace.map(str::to_string),
        })
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to listen on for HTTP requests.
    pub listen_addr: String,
    /// Operation input file; stdin when `None`.
    pub input: Option<PathBuf>,
    /// Streaming routes.
    pub routes: Vec<RouteSpec>,
    /// Change feed options.
    pub tail: TailOptions,
    /// Broker options.
    pub broker: BrokerConfig,
    /// Log level used when RUST_LOG is unset.
    pub log_level: String,
}

impl GatewayConfig {
    /// Build the playlist for the configured routes.
    pub fn playlist(&self) -> Playlist {
        self.routes
            .iter()
            .fold(Playlist::new(), |playlist, route| {
                playlist.add(route.path.clone(), route.filter())
            })
    }
}

impl From<&Args> for GatewayConfig {
    fn from(args: &Args) -> Self {
        let routes = if args.routes.is_empty() {
            vec![RouteSpec::allow_all(DEFAULT_ROUTE)]
        } else {
            args.routes.clone()
        };

        let mut tail = TailOptions::default().with_channel_size(args.channel_size);
        if !args.namespaces.is_empty() {
            tail = tail.with_namespaces(args.namespaces.iter().cloned());
        }
        if let Some(after) = args.after {
            tail = tail.with_after(after);
        }

        Self {
            listen_addr: args.listen.clone(),
            input: args.input.clone(),
            routes,
            tail,
            broker: BrokerConfig::default()
                .with_publish_buffer(args.publish_buffer)
                .with_subscriber_buffer(args.subscriber_buffer)
                .with_overflow(args.overflow),
            log_level: args.log_level.clone(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            input: None,
            routes: vec![RouteSpec::allow_all(DEFAULT_ROUTE)],
            tail: TailOptions::default(),
            broker: BrokerConfig::default(),
            log_level: "info".to_string(),
        }
    }
}
