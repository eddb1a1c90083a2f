//! Per-route delivery filters.
//!
//! A filter decides, for one connected client and one event, whether the
//! client gets to see the event. This is where access control plugs in:
//! the filter sees the request that opened the stream.

use std::fmt;
use std::sync::Arc;

use crate::event::{ChangeEvent, OpKind};

/// Connection context handed to filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Route the client connected through.
    pub route: String,
    /// Request path.
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    /// Request headers with lowercase names, in arrival order.
    pub headers: Vec<(String, String)>,
}

impl RequestContext {
    /// Create a context for a route; the path defaults to the route.
    pub fn new(route: impl Into<String>) -> Self {
        let route = route.into();
        Self {
            path: route.clone(),
            route,
            query: None,
            headers: Vec::new(),
        }
    }

    /// Set the request path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the raw query string.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .push((name.as_ref().to_ascii_lowercase(), value.into()));
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Value of a query parameter. No percent-decoding is applied.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }
}

type Predicate = dyn Fn(&RequestContext, &ChangeEvent) -> bool + Send + Sync;

/// A pure predicate over (connection context, event).
///
/// Evaluated once per event and subscriber at delivery time.
#[derive(Clone)]
pub struct Filter(Arc<Predicate>);

impl Filter {
    /// Wrap a closure.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&RequestContext, &ChangeEvent) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Let every event through.
    pub fn allow_all() -> Self {
        Self::new(|_, _| true)
    }

    /// Only events from one namespace.
    pub fn namespace(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self::new(move |_, event| event.namespace() == Some(namespace.as_str()))
    }

    /// Only events of the given kinds.
    pub fn operations(kinds: impl IntoIterator<Item = OpKind>) -> Self {
        let kinds: Vec<OpKind> = kinds.into_iter().collect();
        Self::new(move |_, event| event.kind().is_some_and(|k| kinds.contains(&k)))
    }

    /// Both filters must pass.
    pub fn and(self, other: Filter) -> Self {
        Self::new(move |ctx, event| self.matches(ctx, event) && other.matches(ctx, event))
    }

    /// Evaluate the filter.
    pub fn matches(&self, context: &RequestContext, event: &ChangeEvent) -> bool {
        (self.0)(context, event)
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").finish_non_exhaustive()
    }
}
