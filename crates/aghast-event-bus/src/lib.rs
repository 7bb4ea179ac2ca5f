//! Event bus with wildcard pub/sub for the aghast hub
//!
//! The EventBus is the in-process message router. Publishers push events onto
//! a single inbound queue; one dispatcher task drains it in publish order and
//! fans each event out to every subscription whose pattern matches:
//!
//! - subscriptions whose pattern equals the event name exactly
//! - wildcard subscriptions of the same depth whose literal segments match
//!
//! Delivery to a subscriber queue never blocks. A full queue is reported as
//! [`BusError::QueueFull`] and through [`EventBus::take_overflow_reports`];
//! the other subscribers still receive the event.

mod registry;

pub use registry::{RegistryError, SubscriberId, SubscriberRegistry, DEFAULT_MAX_SUBSCRIBERS};

use aghast_core::{Event, NameError, TopicPattern};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Default capacity of each subscriber queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default capacity of the shared inbound queue
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("subscriber {subscriber} is already subscribed to '{pattern}'")]
    AlreadySubscribed {
        subscriber: SubscriberId,
        pattern: String,
    },

    #[error("subscriber {subscriber} is not subscribed to '{pattern}'")]
    NotSubscribed {
        subscriber: SubscriberId,
        pattern: String,
    },

    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] NameError),

    #[error("queue of subscriber {subscriber} ({owner}) for '{pattern}' is full, dropped '{event}'")]
    QueueFull {
        subscriber: SubscriberId,
        owner: String,
        pattern: String,
        event: String,
    },

    #[error("inbound queue is full, dropped '{event}'")]
    InboundFull { event: String },

    #[error("event bus is closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

/// Queue sizing for the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    pub queue_capacity: usize,
    pub inbound_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

/// Details of an event that could not be delivered because a queue was full
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowReport {
    pub subscriber: SubscriberId,
    pub owner: String,
    pub pattern: String,
    pub event: String,
}

impl From<OverflowReport> for BusError {
    fn from(report: OverflowReport) -> Self {
        BusError::QueueFull {
            subscriber: report.subscriber,
            owner: report.owner,
            pattern: report.pattern,
            event: report.event,
        }
    }
}

struct Subscription {
    subscriber: SubscriberId,
    pattern: TopicPattern,
    tx: mpsc::Sender<Event>,
}

/// Subscriptions keyed by literal pattern string
#[derive(Default)]
struct SubscriptionTable {
    by_pattern: HashMap<String, Vec<Subscription>>,
    /// Keys of `by_pattern` that contain a wildcard segment
    wildcards: HashSet<String>,
}

impl SubscriptionTable {
    fn len(&self) -> usize {
        self.by_pattern.values().map(Vec::len).sum()
    }

    fn remove(&mut self, subscriber: SubscriberId, pattern: &str) -> bool {
        let Some(subs) = self.by_pattern.get_mut(pattern) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.subscriber != subscriber);
        let removed = subs.len() != before;
        if subs.is_empty() {
            self.by_pattern.remove(pattern);
            self.wildcards.remove(pattern);
        }
        removed
    }
}

#[derive(Default)]
struct Delivery {
    delivered: usize,
    overflows: Vec<OverflowReport>,
    closed: Vec<(SubscriberId, String)>,
}

struct BusInner {
    registry: Arc<SubscriberRegistry>,
    table: RwLock<SubscriptionTable>,
    config: BusConfig,
    overflow_tx: mpsc::UnboundedSender<OverflowReport>,
    overflow_rx: Mutex<Option<mpsc::UnboundedReceiver<OverflowReport>>>,
}

impl BusInner {
    fn owner(&self, id: SubscriberId) -> String {
        self.registry
            .owner(id)
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn deliver(&self, event: &Event) -> Delivery {
        let mut delivery = Delivery::default();
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());

        let exact = table.by_pattern.get(event.name.as_str()).into_iter();
        let wildcard = table
            .wildcards
            .iter()
            .filter_map(|key| table.by_pattern.get(key))
            .filter(|subs| {
                subs.first()
                    .map(|s| s.pattern.matches(&event.name))
                    .unwrap_or(false)
            });

        for subs in exact.chain(wildcard) {
            for sub in subs {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => delivery.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let report = OverflowReport {
                            subscriber: sub.subscriber,
                            owner: self.owner(sub.subscriber),
                            pattern: sub.pattern.to_string(),
                            event: event.name.to_string(),
                        };
                        error!(
                            subscriber = %report.subscriber,
                            owner = %report.owner,
                            pattern = %report.pattern,
                            event = %report.event,
                            "Subscriber queue full, event not delivered"
                        );
                        delivery.overflows.push(report);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        delivery
                            .closed
                            .push((sub.subscriber, sub.pattern.to_string()));
                    }
                }
            }
        }
        drop(table);

        if !delivery.closed.is_empty() {
            let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
            for (subscriber, pattern) in &delivery.closed {
                warn!(
                    subscriber = %subscriber,
                    pattern = %pattern,
                    "Subscriber queue closed without unsubscribe, removing"
                );
                table.remove(*subscriber, pattern);
            }
        }

        trace!(event = %event.name, delivered = delivery.delivered, "Dispatched event");
        delivery
    }
}

/// Handle to the event bus
///
/// Cheap to clone; every clone publishes into the same dispatcher.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
    inbound: mpsc::Sender<Event>,
    shutdown_tx: broadcast::Sender<()>,
}

impl EventBus {
    /// Create the bus and spawn its dispatcher task
    pub fn start(registry: Arc<SubscriberRegistry>, config: BusConfig) -> (Self, JoinHandle<()>) {
        let (inbound, mut inbound_rx) = mpsc::channel::<Event>(config.inbound_capacity.max(1));
        let (overflow_tx, overflow_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let inner = Arc::new(BusInner {
            registry,
            table: RwLock::new(SubscriptionTable::default()),
            config,
            overflow_tx,
            overflow_rx: Mutex::new(Some(overflow_rx)),
        });

        let dispatcher = inner.clone();
        let handle = tokio::spawn(async move {
            info!("Event bus dispatcher started");
            loop {
                tokio::select! {
                    maybe_event = inbound_rx.recv() => {
                        let Some(event) = maybe_event else {
                            break;
                        };
                        for report in dispatcher.deliver(&event).overflows {
                            // Nobody listening for reports is not a reason to stop dispatching
                            let _ = dispatcher.overflow_tx.send(report);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Event bus received shutdown signal");
                        break;
                    }
                }
            }
            info!("Event bus dispatcher stopped");
        });

        (
            Self {
                inner,
                inbound,
                shutdown_tx,
            },
            handle,
        )
    }

    /// The registry subscriber identities are drawn from
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.inner.registry
    }

    /// Subscribe `subscriber` to `pattern`
    ///
    /// Returns the bounded queue events matching the pattern are delivered to.
    pub fn subscribe(
        &self,
        subscriber: SubscriberId,
        pattern: &str,
    ) -> BusResult<mpsc::Receiver<Event>> {
        let pattern = TopicPattern::new(pattern)?;
        let key = pattern.as_str().to_string();

        let mut table = self.inner.table.write().unwrap_or_else(|p| p.into_inner());
        if table
            .by_pattern
            .get(&key)
            .is_some_and(|subs| subs.iter().any(|s| s.subscriber == subscriber))
        {
            return Err(BusError::AlreadySubscribed {
                subscriber,
                pattern: key,
            });
        }

        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        if pattern.is_wildcard() {
            table.wildcards.insert(key.clone());
        }
        table.by_pattern.entry(key).or_default().push(Subscription {
            subscriber,
            pattern,
            tx,
        });

        debug!(subscriber = %subscriber, owner = %self.inner.owner(subscriber), "Subscribed");
        Ok(rx)
    }

    /// Remove the subscription of `subscriber` to `pattern`
    pub fn unsubscribe(&self, subscriber: SubscriberId, pattern: &str) -> BusResult<()> {
        let mut table = self.inner.table.write().unwrap_or_else(|p| p.into_inner());
        if table.remove(subscriber, pattern) {
            debug!(subscriber = %subscriber, pattern, "Unsubscribed");
            Ok(())
        } else {
            Err(BusError::NotSubscribed {
                subscriber,
                pattern: pattern.to_string(),
            })
        }
    }

    /// Remove every subscription held by `subscriber`, returning how many
    pub fn unsubscribe_all(&self, subscriber: SubscriberId) -> usize {
        let mut table = self.inner.table.write().unwrap_or_else(|p| p.into_inner());
        let patterns: Vec<String> = table
            .by_pattern
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| s.subscriber == subscriber))
            .map(|(key, _)| key.clone())
            .collect();
        for pattern in &patterns {
            table.remove(subscriber, pattern);
        }
        patterns.len()
    }

    /// Queue an event for dispatch
    ///
    /// Waits only if the shared inbound queue is full.
    pub async fn publish(&self, event: Event) -> BusResult<()> {
        trace!(event = %event.name, "Publishing event");
        self.inbound.send(event).await.map_err(|_| BusError::Closed)
    }

    /// Queue an event without waiting
    pub fn try_publish(&self, event: Event) -> BusResult<()> {
        self.inbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(event) => {
                error!(event = %event.name, "Event bus inbound queue full");
                BusError::InboundFull {
                    event: event.name.to_string(),
                }
            }
            mpsc::error::TrySendError::Closed(_) => BusError::Closed,
        })
    }

    /// Deliver an event to all matching subscriptions right now
    ///
    /// Returns the number of queues the event was delivered to, or the first
    /// overflow if any subscriber queue was full. Subscribers after a full
    /// queue still receive the event.
    pub fn dispatch(&self, event: &Event) -> BusResult<usize> {
        let delivery = self.inner.deliver(event);
        match delivery.overflows.into_iter().next() {
            Some(report) => Err(report.into()),
            None => Ok(delivery.delivered),
        }
    }

    /// Take the stream of overflow reports produced by the dispatcher
    ///
    /// Only the first caller receives the stream.
    pub fn take_overflow_reports(&self) -> Option<mpsc::UnboundedReceiver<OverflowReport>> {
        self.inner
            .overflow_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Number of active subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner
            .table
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Stop the dispatcher; later publishes fail with [`BusError::Closed`]
    pub fn shutdown(&self) {
        info!("Stopping event bus");
        let _ = self.shutdown_tx.send(());
    }
}
