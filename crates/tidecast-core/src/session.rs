//! Per-client streaming sessions.
//!
//! A session goes `Registering -> Active -> Closing`. Opening it checks the
//! transport and registers with the broker; running it writes the stream
//! preamble, then forwards every event that passes the route filter until
//! the client disconnects. Closing deregisters and releases the session's
//! connection copy on every exit path, including the task being dropped.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::broker::{Broker, SubscriberId, Subscription};
use crate::error::{Capability, Error, Result};
use crate::filter::{Filter, RequestContext};
use crate::source::ConnectionCopy;
use crate::wire::{self, STREAM_HEADERS};

/// Response headers written before the first frame.
pub type Preamble = Vec<(&'static str, &'static str)>;

/// What a transport can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Partial output can be pushed to the client immediately.
    pub flush: bool,
    /// The transport notices when the client goes away.
    pub close_notify: bool,
}

impl Capabilities {
    /// Everything a streaming session needs.
    pub const STREAMING: Self = Self {
        flush: true,
        close_notify: true,
    };

    fn check(&self) -> Result<()> {
        if !self.flush {
            return Err(Error::Unsupported(Capability::Flush));
        }
        if !self.close_notify {
            return Err(Error::Unsupported(Capability::CloseNotify));
        }
        Ok(())
    }
}

/// The client-facing side of a session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Capabilities of this transport.
    fn capabilities(&self) -> Capabilities;

    /// Write the response preamble.
    async fn begin(&mut self, headers: &[(&'static str, &'static str)]) -> Result<()>;

    /// Write one frame and flush it.
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Resolves once the client has gone away.
    async fn closed(&self);
}

/// A transport backed by channels; the receiving halves stand in for the client.
#[derive(Debug)]
pub struct ChannelTransport {
    frames: mpsc::Sender<Bytes>,
    head: Option<oneshot::Sender<Preamble>>,
    capabilities: Capabilities,
}

/// Client end of a [`ChannelTransport`]. Dropping `frames` signals a disconnect.
#[derive(Debug)]
pub struct ClientEnd {
    /// Receives the preamble once the session becomes active.
    pub head: oneshot::Receiver<Preamble>,
    /// Receives frames as they are flushed.
    pub frames: mpsc::Receiver<Bytes>,
}

impl ChannelTransport {
    /// Create a transport and its client end.
    pub fn pair(buffer: usize) -> (Self, ClientEnd) {
        let (frames_tx, frames_rx) = mpsc::channel(buffer.max(1));
        let (head_tx, head_rx) = oneshot::channel();
        let transport = Self {
            frames: frames_tx,
            head: Some(head_tx),
            capabilities: Capabilities::STREAMING,
        };
        let client = ClientEnd {
            head: head_rx,
            frames: frames_rx,
        };
        (transport, client)
    }

    /// Override the advertised capabilities.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn begin(&mut self, headers: &[(&'static str, &'static str)]) -> Result<()> {
        let head = self.head.take().ok_or(Error::TransportClosed)?;
        head.send(headers.to_vec())
            .map_err(|_| Error::TransportClosed)
    }

    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| Error::TransportClosed)
    }

    async fn closed(&self) {
        self.frames.closed().await
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered with the broker, stream not started.
    Registering,
    /// Streaming events.
    Active,
    /// Terminal.
    Closing,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away.
    Disconnected,
    /// Writing to the client failed.
    WriteFailed,
    /// The broker removed the subscriber or stopped.
    Unsubscribed,
}

/// Outcome of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Subscriber the session was registered as.
    pub subscriber: SubscriberId,
    /// Why the session ended.
    pub reason: CloseReason,
    /// Events written to the client.
    pub delivered: u64,
    /// Events the filter rejected.
    pub filtered: u64,
}

/// A streaming session for one client connection.
pub struct ClientSession<T> {
    subscription: Subscription,
    transport: T,
    filter: Filter,
    context: RequestContext,
    _copy: ConnectionCopy,
    state: watch::Sender<SessionState>,
    delivered: u64,
    filtered: u64,
}

impl<T: Transport> ClientSession<T> {
    /// Check the transport and register with the broker.
    ///
    /// Fails without registering if the transport cannot stream or cannot
    /// report disconnects. The connection copy is released on failure.
    pub fn open(
        broker: &Broker,
        transport: T,
        filter: Filter,
        context: RequestContext,
        copy: ConnectionCopy,
    ) -> Result<Self> {
        transport.capabilities().check()?;

        let subscription = broker.register();
        debug!(
            subscriber = %subscription.id(),
            route = %context.route,
            "session opened"
        );

        let (state, _) = watch::channel(SessionState::Registering);
        Ok(Self {
            subscription,
            transport,
            filter,
            context,
            _copy: copy,
            state,
            delivered: 0,
            filtered: 0,
        })
    }

    /// Subscriber id of this session.
    pub fn id(&self) -> SubscriberId {
        self.subscription.id()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow state changes. The receiver keeps the final `Closing` state
    /// after the session is gone.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Stream until the client disconnects, then close.
    pub async fn run(mut self) -> SessionSummary {
        self.state.send_replace(SessionState::Active);
        let reason = self.stream().await;
        self.close(reason)
    }

    async fn stream(&mut self) -> CloseReason {
        if self.transport.begin(&STREAM_HEADERS).await.is_err() {
            return CloseReason::Disconnected;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.transport.closed() => return CloseReason::Disconnected,
                delivery = self.subscription.recv() => {
                    let Some(event) = delivery else {
                        return CloseReason::Unsubscribed;
                    };
                    if !self.filter.matches(&self.context, &event) {
                        self.filtered += 1;
                        continue;
                    }
                    let frame = match wire::encode_event(&event) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(event_id = event.id(), error = %err, "failed to encode event");
                            continue;
                        }
                    };
                    if self.transport.send(frame).await.is_err() {
                        return CloseReason::WriteFailed;
                    }
                    self.delivered += 1;
                    trace!(subscriber = %self.id(), event_id = event.id(), "event delivered");
                }
            }
        }
    }

    fn close(self, reason: CloseReason) -> SessionSummary {
        self.state.send_replace(SessionState::Closing);
        let summary = SessionSummary {
            subscriber: self.id(),
            reason,
            delivered: self.delivered,
            filtered: self.filtered,
        };
        debug!(
            subscriber = %summary.subscriber,
            route = %self.context.route,
            reason = ?summary.reason,
            delivered = summary.delivered,
            filtered = summary.filtered,
            "session closed"
        );
        // Dropping self deregisters the subscription and releases the copy.
        summary
    }
}
