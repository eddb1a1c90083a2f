//! Event broker.
//!
//! The broker is a single task that owns the set of connected subscribers.
//! Everything else talks to it over channels: joins, leaves, publishes and
//! stats requests. Nothing outside the control loop ever touches the
//! registry, so no locking is involved.
//!
//! Fan-out is sequential. Under [`OverflowPolicy::Block`] the loop waits on
//! each subscriber's queue in turn, which means one subscriber that stops
//! reading holds up the broadcast for everyone, and holds up joins and
//! leaves queued behind it, until it reads again or goes away. The other
//! policies trade that head-of-line blocking for lost events.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::event::ChangeEvent;

/// Default capacity of the publish queue.
pub const DEFAULT_PUBLISH_BUFFER: usize = 1;

/// Default capacity of each subscriber's delivery queue.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1;

/// An event as handed to subscribers.
pub type Delivery = Arc<ChangeEvent>;

/// What the broker does when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wait until the subscriber makes room.
    #[default]
    Block,
    /// Skip this event for that subscriber.
    DropEvent,
    /// Remove the subscriber, ending its stream.
    Disconnect,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverflowPolicy::Block => "block",
            OverflowPolicy::DropEvent => "drop-event",
            OverflowPolicy::Disconnect => "disconnect",
        })
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "block" => Ok(OverflowPolicy::Block),
            "drop-event" => Ok(OverflowPolicy::DropEvent),
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            other => Err(format!(
                "unknown overflow policy '{}' (expected block, drop-event or disconnect)",
                other
            )),
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Capacity of the publish queue.
    pub publish_buffer: usize,
    /// Capacity of each subscriber's delivery queue.
    pub subscriber_buffer: usize,
    /// Behavior when a subscriber's queue is full.
    pub overflow: OverflowPolicy,
}

impl BrokerConfig {
    /// Set the publish queue capacity.
    pub fn with_publish_buffer(mut self, size: usize) -> Self {
        self.publish_buffer = size;
        self
    }

    /// Set the per-subscriber queue capacity.
    pub fn with_subscriber_buffer(mut self, size: usize) -> Self {
        self.subscriber_buffer = size;
        self
    }

    /// Set the overflow policy.
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            publish_buffer: DEFAULT_PUBLISH_BUFFER,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Registry key of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Numeric value of the id.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of broker counters, taken inside the control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Subscribers currently registered.
    pub subscribers: usize,
    /// Events fanned out so far.
    pub published: u64,
    /// Individual deliveries into subscriber queues.
    pub delivered: u64,
    /// Deliveries skipped under [`OverflowPolicy::DropEvent`].
    pub dropped: u64,
    /// Subscribers removed under [`OverflowPolicy::Disconnect`].
    pub evicted: u64,
}

struct Join {
    id: SubscriberId,
    tx: mpsc::Sender<Delivery>,
}

/// Handle to a running broker. Cheap to clone.
///
/// The control loop stops once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct Broker {
    joins: mpsc::UnboundedSender<Join>,
    leaves: mpsc::UnboundedSender<SubscriberId>,
    publishes: mpsc::Sender<Delivery>,
    stats_requests: mpsc::UnboundedSender<oneshot::Sender<BrokerStats>>,
    next_id: Arc<AtomicU64>,
    subscriber_buffer: usize,
}

impl Broker {
    /// Create a broker handle and its control loop without spawning it.
    pub fn new(config: BrokerConfig) -> (Self, BrokerLoop) {
        let (joins_tx, joins_rx) = mpsc::unbounded_channel();
        let (leaves_tx, leaves_rx) = mpsc::unbounded_channel();
        let (publish_tx, publish_rx) = mpsc::channel(config.publish_buffer.max(1));
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();

        let broker = Self {
            joins: joins_tx,
            leaves: leaves_tx,
            publishes: publish_tx,
            stats_requests: stats_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            subscriber_buffer: config.subscriber_buffer.max(1),
        };
        let control = BrokerLoop {
            joins: joins_rx,
            leaves: leaves_rx,
            publishes: publish_rx,
            stats_requests: stats_rx,
            subscribers: HashMap::new(),
            overflow: config.overflow,
            stats: BrokerStats::default(),
        };

        (broker, control)
    }

    /// Create a broker and spawn its control loop on the current runtime.
    pub fn start(config: BrokerConfig) -> Self {
        let (broker, control) = Self::new(config);
        tokio::spawn(control.run());
        broker
    }

    /// Register a new subscriber.
    ///
    /// The join is queued; it takes effect before any publish queued after
    /// this call returns.
    pub fn register(&self) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);

        // If the loop is gone the sender is dropped with the message and the
        // subscription simply sees a closed queue.
        let _ = self.joins.send(Join { id, tx });

        Subscription {
            id,
            events: rx,
            leaves: self.leaves.clone(),
        }
    }

    /// Remove a subscriber. Removing an unknown subscriber is a no-op.
    pub fn deregister(&self, id: SubscriberId) {
        let _ = self.leaves.send(id);
    }

    /// Queue an event for fan-out to every subscriber registered when the
    /// loop gets to it.
    pub async fn publish(&self, event: ChangeEvent) -> Result<()> {
        self.publishes
            .send(Arc::new(event))
            .await
            .map_err(|_| Error::BrokerStopped)
    }

    /// Take a snapshot of the broker counters.
    ///
    /// Answered after every join, leave and publish queued before the call.
    pub async fn stats(&self) -> Result<BrokerStats> {
        let (tx, rx) = oneshot::channel();
        self.stats_requests
            .send(tx)
            .map_err(|_| Error::BrokerStopped)?;
        rx.await.map_err(|_| Error::BrokerStopped)
    }

    /// Whether the control loop is still running.
    pub fn is_running(&self) -> bool {
        !self.publishes.is_closed()
    }
}

/// A registered subscriber's end of the broker.
///
/// Dropping it deregisters the subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    events: mpsc::Receiver<Delivery>,
    leaves: mpsc::UnboundedSender<SubscriberId>,
}

impl Subscription {
    /// Registry key of this subscriber.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the broker has removed this subscriber or stopped.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Close the queue first so a send blocked on it fails right away.
        self.events.close();
        let _ = self.leaves.send(self.id);
    }
}

/// The broker's control loop. Owns the subscriber registry.
pub struct BrokerLoop {
    joins: mpsc::UnboundedReceiver<Join>,
    leaves: mpsc::UnboundedReceiver<SubscriberId>,
    publishes: mpsc::Receiver<Delivery>,
    stats_requests: mpsc::UnboundedReceiver<oneshot::Sender<BrokerStats>>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Delivery>>,
    overflow: OverflowPolicy,
    stats: BrokerStats,
}

impl BrokerLoop {
    /// Run until every [`Broker`] handle is dropped.
    ///
    /// One request is taken and fully applied per iteration. Joins and
    /// leaves win over publishes, and stats requests come last.
    pub async fn run(mut self) {
        info!(overflow = %self.overflow, "broker started");

        loop {
            tokio::select! {
                biased;
                Some(join) = self.joins.recv() => self.handle_join(join),
                Some(id) = self.leaves.recv() => self.handle_leave(id),
                event = self.publishes.recv() => match event {
                    Some(event) => self.fan_out(event).await,
                    None => break,
                },
                Some(reply) = self.stats_requests.recv() => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }

        info!(
            subscribers = self.subscribers.len(),
            published = self.stats.published,
            "broker stopped"
        );
    }

    fn handle_join(&mut self, join: Join) {
        self.subscribers.insert(join.id, join.tx);
        debug!(
            subscriber = %join.id,
            subscribers = self.subscribers.len(),
            "subscriber joined"
        );
    }

    fn handle_leave(&mut self, id: SubscriberId) {
        if self.subscribers.remove(&id).is_some() {
            debug!(
                subscriber = %id,
                subscribers = self.subscribers.len(),
                "subscriber left"
            );
        }
    }

    async fn fan_out(&mut self, event: Delivery) {
        self.stats.published += 1;

        let mut gone = Vec::new();
        let mut evicted = Vec::new();
        for (&id, tx) in &self.subscribers {
            match self.overflow {
                OverflowPolicy::Block => {
                    if tx.send(event.clone()).await.is_err() {
                        gone.push(id);
                        continue;
                    }
                }
                OverflowPolicy::DropEvent | OverflowPolicy::Disconnect => {
                    match tx.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Closed(_)) => {
                            gone.push(id);
                            continue;
                        }
                        Err(TrySendError::Full(_)) => {
                            if self.overflow == OverflowPolicy::Disconnect {
                                warn!(subscriber = %id, event_id = event.id(), "subscriber queue full, disconnecting");
                                evicted.push(id);
                            } else {
                                warn!(subscriber = %id, event_id = event.id(), "subscriber queue full, dropping event");
                                self.stats.dropped += 1;
                            }
                            continue;
                        }
                    }
                }
            }
            self.stats.delivered += 1;
        }

        for id in &gone {
            self.subscribers.remove(id);
            debug!(subscriber = %id, "subscriber queue closed, removed");
        }
        for id in &evicted {
            self.subscribers.remove(id);
        }
        self.stats.evicted += evicted.len() as u64;

        trace!(
            event_id = event.id(),
            subscribers = self.subscribers.len(),
            "event fanned out"
        );
    }

    fn snapshot(&self) -> BrokerStats {
        BrokerStats {
            subscribers: self.subscribers.len(),
            ..self.stats
        }
    }
}
