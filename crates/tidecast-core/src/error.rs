//! Core error types.

use std::fmt;

use thiserror::Error;

/// A transport capability a streaming session depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Pushing partial output to the client without waiting for the response to end.
    Flush,
    /// Being told asynchronously that the client went away.
    CloseNotify,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Flush => f.write_str("streaming"),
            Capability::CloseNotify => f.write_str("close notification"),
        }
    }
}

/// Core errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport lacks a capability required for streaming.
    #[error("{0} unsupported")]
    Unsupported(Capability),

    /// The broker control loop is no longer running.
    #[error("broker is not running")]
    BrokerStopped,

    /// The client side of a transport has gone away.
    #[error("transport closed")]
    TransportClosed,

    /// Nobody is consuming the change feed any more.
    #[error("change feed closed")]
    FeedClosed,

    /// A string could not be parsed as an object id.
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors reported by a change feed alongside its operations.
///
/// These never stop the feed; the ingestion task logs them and keeps going.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// A record could not be decoded.
    #[error("line {line}: {message}")]
    Decode {
        /// 1-based line number in the input.
        line: u64,
        /// Decoder message.
        message: String,
    },

    /// Reading from the underlying input failed.
    #[error("io error: {0}")]
    Io(String),

    /// Error reported by the upstream data store.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::Io(err.to_string())
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
