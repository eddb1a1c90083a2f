//! Change feed adapters and the ingestion task.
//!
//! A [`Connection`] hands out a [`ChangeFeed`]: one channel of operations
//! and one of non-fatal errors. The ingestion task drains both, logs the
//! errors, and publishes every accepted operation to the broker as a
//! [`ChangeEvent`].

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::broker::Broker;
use crate::error::{Error, Result, SourceError};
use crate::event::{ChangeEvent, Op};

/// Default capacity of feed channels.
pub const DEFAULT_CHANNEL_SIZE: usize = 512;

/// A session-scoped copy of the upstream connection. Released on drop.
pub type ConnectionCopy = Box<dyn Any + Send>;

/// Operations and errors produced by a change feed.
#[derive(Debug)]
pub struct ChangeFeed {
    /// Operations in feed order.
    pub ops: mpsc::Receiver<Op>,
    /// Non-fatal errors.
    pub errors: mpsc::Receiver<SourceError>,
}

impl ChangeFeed {
    /// A feed that has already ended.
    pub fn closed() -> Self {
        let (_, ops) = mpsc::channel(1);
        let (_, errors) = mpsc::channel(1);
        Self { ops, errors }
    }
}

/// Options for tailing a change feed.
#[derive(Debug, Clone)]
pub struct TailOptions {
    /// Only pass operations from these namespaces. `None` passes all.
    pub namespaces: Option<Vec<String>>,
    /// Only pass operations with a timestamp strictly after this one.
    pub after: Option<u64>,
    /// Capacity of the feed channels.
    pub channel_size: usize,
}

impl TailOptions {
    /// Restrict the feed to the given namespaces.
    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = Some(namespaces.into_iter().map(Into::into).collect());
        self
    }

    /// Resume after a timestamp.
    pub fn with_after(mut self, timestamp: u64) -> Self {
        self.after = Some(timestamp);
        self
    }

    /// Set the feed channel capacity.
    pub fn with_channel_size(mut self, size: usize) -> Self {
        self.channel_size = size;
        self
    }

    /// Whether an operation passes these options.
    pub fn accepts(&self, op: &Op) -> bool {
        if let Some(after) = self.after {
            if op.timestamp <= after {
                return false;
            }
        }
        match &self.namespaces {
            Some(namespaces) => namespaces.iter().any(|ns| *ns == op.namespace),
            None => true,
        }
    }
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            namespaces: None,
            after: None,
            channel_size: DEFAULT_CHANNEL_SIZE,
        }
    }
}

/// An upstream data store connection.
pub trait Connection: Send + Sync + 'static {
    /// Start tailing the change feed.
    fn tail(&self, options: &TailOptions) -> ChangeFeed;

    /// Take a copy of the connection for one client session.
    fn copy(&self) -> ConnectionCopy;
}

/// Counts connection copies that have not been released yet.
#[derive(Debug, Clone, Default)]
pub struct CopyTracker {
    open: Arc<AtomicUsize>,
}

struct TrackedCopy {
    open: Arc<AtomicUsize>,
}

impl Drop for TrackedCopy {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CopyTracker {
    /// Hand out a new copy.
    pub fn acquire(&self) -> ConnectionCopy {
        self.open.fetch_add(1, Ordering::SeqCst);
        Box::new(TrackedCopy {
            open: self.open.clone(),
        })
    }

    /// Copies handed out and not yet released.
    pub fn open_copies(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

/// Sending side of a [`ChannelConnection`].
#[derive(Debug, Clone)]
pub struct FeedSender {
    ops: mpsc::Sender<Op>,
    errors: mpsc::Sender<SourceError>,
}

impl FeedSender {
    /// Emit an operation.
    pub async fn send(&self, op: Op) -> Result<()> {
        self.ops.send(op).await.map_err(|_| Error::FeedClosed)
    }

    /// Emit a non-fatal error.
    pub async fn error(&self, err: SourceError) -> Result<()> {
        self.errors.send(err).await.map_err(|_| Error::FeedClosed)
    }
}

/// An in-process connection whose feed is driven through a [`FeedSender`].
pub struct ChannelConnection {
    feed: Mutex<Option<ChangeFeed>>,
    copies: CopyTracker,
}

impl ChannelConnection {
    /// Create a connection and the sender that drives its feed.
    pub fn new(buffer: usize) -> (Self, FeedSender) {
        let (ops_tx, ops_rx) = mpsc::channel(buffer.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(buffer.max(1));
        let connection = Self {
            feed: Mutex::new(Some(ChangeFeed {
                ops: ops_rx,
                errors: errors_rx,
            })),
            copies: CopyTracker::default(),
        };
        let sender = FeedSender {
            ops: ops_tx,
            errors: errors_tx,
        };
        (connection, sender)
    }

    /// Session copies currently held.
    pub fn open_copies(&self) -> usize {
        self.copies.open_copies()
    }
}

impl Connection for ChannelConnection {
    /// The feed can be tailed once; later calls get a closed feed.
    fn tail(&self, _options: &TailOptions) -> ChangeFeed {
        self.feed.lock().take().unwrap_or_else(|| {
            warn!("channel feed already tailed");
            ChangeFeed::closed()
        })
    }

    fn copy(&self) -> ConnectionCopy {
        self.copies.acquire()
    }
}

/// A connection reading newline-delimited JSON operations.
///
/// Blank lines are skipped. Lines that fail to decode are reported on the
/// error channel and the feed continues.
pub struct LineConnection<R> {
    reader: Mutex<Option<R>>,
    copies: CopyTracker,
}

impl<R> LineConnection<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    /// Wrap a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            copies: CopyTracker::default(),
        }
    }

    /// Session copies currently held.
    pub fn open_copies(&self) -> usize {
        self.copies.open_copies()
    }
}

impl<R> Connection for LineConnection<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    fn tail(&self, options: &TailOptions) -> ChangeFeed {
        let Some(reader) = self.reader.lock().take() else {
            warn!("line feed already tailed");
            return ChangeFeed::closed();
        };

        let (ops_tx, ops_rx) = mpsc::channel(options.channel_size.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(options.channel_size.max(1));
        tokio::spawn(read_lines(reader, ops_tx, errors_tx));

        ChangeFeed {
            ops: ops_rx,
            errors: errors_rx,
        }
    }

    fn copy(&self) -> ConnectionCopy {
        self.copies.acquire()
    }
}

async fn read_lines<R>(reader: R, ops: mpsc::Sender<Op>, errors: mpsc::Sender<SourceError>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0u64;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                line_no += 1;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Op>(line) {
                    Ok(op) => {
                        if ops.send(op).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = errors
                            .send(SourceError::Decode {
                                line: line_no,
                                message: err.to_string(),
                            })
                            .await;
                    }
                }
            }
            Ok(None) => {
                debug!(lines = line_no, "line feed exhausted");
                break;
            }
            Err(err) => {
                let _ = errors.send(err.into()).await;
                break;
            }
        }
    }
}

/// Counters reported by an [`Ingestor`] when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Operations published to the broker.
    pub published: u64,
    /// Operations rejected by the tail options or not wrappable as events.
    pub skipped: u64,
    /// Feed errors logged.
    pub errors: u64,
}

/// Drains a change feed into the broker.
pub struct Ingestor {
    feed: ChangeFeed,
    options: TailOptions,
    broker: Broker,
}

impl Ingestor {
    /// Create an ingestor.
    pub fn new(feed: ChangeFeed, options: TailOptions, broker: Broker) -> Self {
        Self {
            feed,
            options,
            broker,
        }
    }

    /// Run until the feed's operation channel closes or the broker stops.
    ///
    /// Errors already queued when the operation channel closes are still
    /// logged before returning.
    pub async fn run(self) -> IngestSummary {
        let Self {
            mut feed,
            options,
            broker,
        } = self;
        let mut summary = IngestSummary::default();
        info!("ingestion started");

        let mut errors_open = true;
        loop {
            tokio::select! {
                biased;
                err = feed.errors.recv(), if errors_open => match err {
                    Some(err) => log_feed_error(&mut summary, &err),
                    None => errors_open = false,
                },
                op = feed.ops.recv() => match op {
                    Some(op) => match publish_op(&options, &broker, op).await {
                        Ok(true) => summary.published += 1,
                        Ok(false) => summary.skipped += 1,
                        Err(_) => {
                            info!(published = summary.published, "ingestion stopped (broker gone)");
                            return summary;
                        }
                    },
                    None => break,
                },
            }
        }

        while let Ok(err) = feed.errors.try_recv() {
            log_feed_error(&mut summary, &err);
        }

        info!(
            published = summary.published,
            skipped = summary.skipped,
            errors = summary.errors,
            "ingestion stopped (feed closed)"
        );
        summary
    }
}

fn log_feed_error(summary: &mut IngestSummary, err: &SourceError) {
    summary.errors += 1;
    warn!(error = %err, "change feed error");
}

/// Publish one operation. `Ok(false)` means it was skipped.
async fn publish_op(options: &TailOptions, broker: &Broker, op: Op) -> Result<bool> {
    if !options.accepts(&op) {
        trace!(ns = %op.namespace, ts = op.timestamp, "operation skipped");
        return Ok(false);
    }

    let event = match ChangeEvent::from_op(&op) {
        Ok(event) => event,
        Err(err) => {
            warn!(ns = %op.namespace, error = %err, "failed to wrap operation");
            return Ok(false);
        }
    };

    trace!(event_id = event.id(), ns = %op.namespace, kind = %op.kind, "publishing change");
    broker.publish(event).await?;
    Ok(true)
}

/// Tail a connection and spawn the ingestion task.
pub fn start_ingest(
    connection: &dyn Connection,
    options: TailOptions,
    broker: Broker,
) -> JoinHandle<IngestSummary> {
    let feed = connection.tail(&options);
    let ingestor = Ingestor::new(feed, options, broker);
    tokio::spawn(ingestor.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, Subscription};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv_id(sub: &mut Subscription) -> String {
        timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("subscription ended")
            .id()
            .to_string()
    }

    #[test]
    fn test_tail_options_accepts() {
        let op = Op::insert("app.users", "1", json!({})).with_timestamp(10);

        assert!(TailOptions::default().accepts(&op));
        assert!(TailOptions::default().with_after(9).accepts(&op));
        assert!(!TailOptions::default().with_after(10).accepts(&op));
        assert!(TailOptions::default()
            .with_namespaces(["app.users", "app.posts"])
            .accepts(&op));
        assert!(!TailOptions::default()
            .with_namespaces(["app.posts"])
            .accepts(&op));
    }

    #[test]
    fn test_copy_tracker() {
        let tracker = CopyTracker::default();
        let first = tracker.acquire();
        let second = tracker.acquire();
        assert_eq!(tracker.open_copies(), 2);

        drop(first);
        assert_eq!(tracker.open_copies(), 1);
        drop(second);
        assert_eq!(tracker.open_copies(), 0);
    }

    #[tokio::test]
    async fn test_ingest_publishes_and_survives_errors() {
        let broker = Broker::start(BrokerConfig::default().with_subscriber_buffer(8));
        let mut sub = broker.register();

        let (connection, feed) = ChannelConnection::new(8);
        let options = TailOptions::default().with_namespaces(["app.users"]);
        let handle = start_ingest(&connection, options, broker.clone());

        feed.send(Op::insert("app.users", "1", json!({}))).await.unwrap();
        feed.error(SourceError::Upstream("cursor lost".to_string()))
            .await
            .unwrap();
        feed.send(Op::insert("app.posts", "2", json!({}))).await.unwrap();
        feed.send(Op::delete("app.users", "3")).await.unwrap();

        assert_eq!(recv_id(&mut sub).await, "1");
        assert_eq!(recv_id(&mut sub).await, "3");

        drop(feed);
        let summary = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(summary.published, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(broker.stats().await.unwrap().published, 2);
    }

    #[tokio::test]
    async fn test_ingest_logs_errors_queued_at_shutdown() {
        for _ in 0..50 {
            let broker = Broker::start(BrokerConfig::default());
            let (connection, feed) = ChannelConnection::new(4);
            let change_feed = connection.tail(&TailOptions::default());

            feed.error(SourceError::Upstream("boom".to_string()))
                .await
                .unwrap();
            feed.error(SourceError::Decode {
                line: 9,
                message: "trailing garbage".to_string(),
            })
            .await
            .unwrap();
            drop(feed);

            let summary = Ingestor::new(change_feed, TailOptions::default(), broker)
                .run()
                .await;
            assert_eq!(summary.errors, 2);
            assert_eq!(summary.published, 0);
        }
    }

    #[tokio::test]
    async fn test_line_feed_trailing_garbage_is_counted() {
        let broker = Broker::start(BrokerConfig::default().with_subscriber_buffer(4));
        let input: &[u8] = b"{\"id\":1,\"op\":\"i\",\"ns\":\"app.users\"}\n{oops\nnot json\n";
        let connection = LineConnection::new(input);

        let summary = timeout(
            Duration::from_secs(5),
            start_ingest(&connection, TailOptions::default(), broker),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(summary.published, 1);
        assert_eq!(summary.errors, 2);
    }

    #[tokio::test]
    async fn test_channel_feed_tails_once() {
        let (connection, _feed) = ChannelConnection::new(1);
        let _first = connection.tail(&TailOptions::default());
        let mut second = connection.tail(&TailOptions::default());
        assert!(second.ops.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_line_feed() {
        let input: &[u8] = b"{\"id\":1,\"op\":\"i\",\"ns\":\"app.users\"}\nnot json\n\n{\"id\":{\"$oid\":\"5f2a0c3e9b1d4e0012ab34cd\"},\"op\":\"d\",\"ns\":\"app.users\"}\n";
        let connection = LineConnection::new(input);
        let mut feed = connection.tail(&TailOptions::default());

        let first = feed.ops.recv().await.unwrap();
        assert_eq!(first.id.to_event_id(), "1");
        let second = feed.ops.recv().await.unwrap();
        assert_eq!(second.id.to_event_id(), "5f2a0c3e9b1d4e0012ab34cd");
        assert!(feed.ops.recv().await.is_none());

        match feed.errors.recv().await.unwrap() {
            SourceError::Decode { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other:?}"),
        }

        let copy = connection.copy();
        assert_eq!(connection.open_copies(), 1);
        drop(copy);
        assert_eq!(connection.open_copies(), 0);
    }
}
