//! Event stream endpoint.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    response::Response,
    routing::{get, MethodRouter},
};
use tidecast_core::{ChannelTransport, ClientEnd, ClientSession, Filter, RequestContext};
use tracing::debug;

use crate::error::AppError;
use crate::AppState;

/// Frames buffered between a session and the response body.
const FRAME_BUFFER: usize = 1;

/// GET handler streaming the events that pass `filter` on `route`.
pub fn handler(route: String, filter: Filter) -> MethodRouter<AppState> {
    get(
        move |State(state): State<AppState>, uri: Uri, headers: HeaderMap| {
            let context = request_context(&route, &uri, &headers);
            let filter = filter.clone();
            async move { stream(state, filter, context).await }
        },
    )
}

fn request_context(route: &str, uri: &Uri, headers: &HeaderMap) -> RequestContext {
    let mut context = RequestContext::new(route).with_path(uri.path());
    if let Some(query) = uri.query() {
        context = context.with_query(query);
    }
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            context = context.with_header(name.as_str(), value);
        }
    }
    context
}

/// Open a session for one client and hand its frames to the response body.
///
/// A hyper response body is written as soon as a frame is ready and is
/// dropped when the client goes away, so the channel transport used here
/// always advertises both streaming capabilities.
pub async fn stream(
    state: AppState,
    filter: Filter,
    context: RequestContext,
) -> Result<Response, AppError> {
    let (transport, client) = ChannelTransport::pair(FRAME_BUFFER);
    respond(state, transport, client, filter, context).await
}

/// Run a session over `transport` and stream what reaches `client`.
///
/// The session runs on its own task. When the client goes away the body is
/// dropped, which closes the transport and lets the session deregister.
/// A transport lacking a capability is rejected before registering.
pub async fn respond(
    state: AppState,
    transport: ChannelTransport,
    client: ClientEnd,
    filter: Filter,
    context: RequestContext,
) -> Result<Response, AppError> {
    if !state.broker.is_running() {
        return Err(tidecast_core::Error::BrokerStopped.into());
    }

    let session = ClientSession::open(
        &state.broker,
        transport,
        filter,
        context,
        state.connection.copy(),
    )?;
    let subscriber = session.id();

    tokio::spawn(async move {
        let summary = session.run().await;
        debug!(
            subscriber = %summary.subscriber,
            reason = ?summary.reason,
            delivered = summary.delivered,
            "stream finished"
        );
    });

    let head = client
        .head
        .await
        .map_err(|_| AppError::Internal(format!("session {} ended before streaming", subscriber)))?;

    let mut response = Response::builder().status(StatusCode::OK);
    for (name, value) in head {
        response = response.header(name, value);
    }

    let frames = futures::stream::unfold(client.frames, |mut frames| async move {
        frames
            .recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(frame), frames))
    });

    response
        .body(Body::from_stream(frames))
        .map_err(|e| AppError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use axum::response::IntoResponse;
    use std::sync::Arc;
    use tidecast_core::{Broker, BrokerConfig, Capabilities, ChannelConnection};

    #[tokio::test]
    async fn test_transport_without_close_notify_is_500() {
        let broker = Broker::start(BrokerConfig::default());
        let (connection, _feed) = ChannelConnection::new(1);
        let connection = Arc::new(connection);
        let state = AppState::new(broker.clone(), connection.clone());

        let (transport, client) = ChannelTransport::pair(FRAME_BUFFER);
        let transport = transport.with_capabilities(Capabilities {
            flush: true,
            close_notify: false,
        });

        let err = respond(
            state,
            transport,
            client,
            Filter::allow_all(),
            RequestContext::new("/events"),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(err, AppError::Unsupported(_)));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(broker.stats().await.unwrap().subscribers, 0);
        assert_eq!(connection.open_copies(), 0);
    }

    #[test]
    fn test_request_context() {
        let uri: Uri = "/users?token=abc".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", HeaderValue::from_static("acme"));

        let context = request_context("/users", &uri, &headers);
        assert_eq!(context.route, "/users");
        assert_eq!(context.path, "/users");
        assert_eq!(context.query_param("token"), Some("abc"));
        assert_eq!(context.header("X-Tenant"), Some("acme"));
    }
}
