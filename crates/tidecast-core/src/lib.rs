//! tidecast core - change event broker and streaming sessions.
//!
//! Change operations come in from a [`Connection`]'s feed, are wrapped as
//! [`ChangeEvent`]s and published to the [`Broker`], which fans each one out
//! to every registered [`ClientSession`]. Sessions apply their route's
//! [`Filter`] and write Server-Sent Events frames to their [`Transport`].

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod broker;
pub mod error;
pub mod event;
pub mod filter;
pub mod session;
pub mod source;
pub mod wire;

pub use broker::{
    Broker, BrokerConfig, BrokerLoop, BrokerStats, Delivery, OverflowPolicy, SubscriberId,
    Subscription,
};
pub use error::{Capability, Error, Result, SourceError};
pub use event::{ChangeEvent, NativeId, ObjectId, Op, OpKind};
pub use filter::{Filter, RequestContext};
pub use session::{
    Capabilities, ChannelTransport, ClientEnd, ClientSession, CloseReason, Preamble,
    SessionState, SessionSummary, Transport,
};
pub use source::{
    start_ingest, ChangeFeed, ChannelConnection, Connection, ConnectionCopy, CopyTracker,
    FeedSender, IngestSummary, Ingestor, LineConnection, TailOptions,
};
pub use wire::{encode_event, STREAM_HEADERS};
