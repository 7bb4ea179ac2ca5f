//! In-process broker
//!
//! `MemoryBroker` stands in for an external broker when no broker address is
//! configured, and in tests. Each [`MemoryBroker::connect`] call yields an
//! independent connection with its own subscriptions; publishes from any
//! connection reach every matching subscription. Retained messages are
//! replayed to new subscriptions. The broker counts subscribe and unsubscribe
//! calls per topic so reference counting in the bridge can be observed, and
//! keeps the most recent publishes for inspection.
//!
//! Delivery never waits on a subscriber: a publish that finds a
//! subscription's queue full is dropped for that subscription only.

use aghast_core::{Message, QoS};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::filter::topic_matches;
use crate::transport::{BrokerTransport, ConnectionEvent};
use crate::BridgeResult;

const DEFAULT_UPSTREAM_CAPACITY: usize = 256;
/// Publishes kept for [`MemoryBroker::published`]
pub const PUBLISHED_HISTORY: usize = 1024;

struct BrokerSubscription {
    connection: u64,
    filter: String,
    tx: mpsc::Sender<Message>,
}

#[derive(Default)]
struct BrokerState {
    subscriptions: Vec<BrokerSubscription>,
    retained: HashMap<String, Message>,
    subscribe_calls: HashMap<String, usize>,
    unsubscribe_calls: HashMap<String, usize>,
    published: VecDeque<Message>,
}

struct BrokerShared {
    state: Mutex<BrokerState>,
    next_connection: AtomicU64,
    capacity: usize,
}

impl BrokerShared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// An in-process publish/subscribe broker
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_UPSTREAM_CAPACITY)
    }

    /// Broker whose per-subscription delivery queues hold `capacity` messages
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                state: Mutex::new(BrokerState::default()),
                next_connection: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Open a new, independent connection
    pub fn connect(&self) -> MemoryTransport {
        let connection = self.shared.next_connection.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(8);
        debug!(connection, "Memory broker connection opened");
        MemoryTransport {
            shared: self.shared.clone(),
            connection,
            events,
        }
    }

    /// Number of broker-level subscribe calls seen for `topic`
    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .subscribe_calls
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Number of broker-level unsubscribe calls seen for `topic`
    pub fn unsubscribe_count(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .unsubscribe_calls
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Number of live broker-level subscriptions to exactly `topic`
    pub fn active_subscriptions(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.filter == topic)
            .count()
    }

    /// The last [`PUBLISHED_HISTORY`] published messages, oldest first
    pub fn published(&self) -> Vec<Message> {
        self.shared.lock().published.iter().cloned().collect()
    }

    /// Messages published to exactly `topic`
    pub fn published_to(&self, topic: &str) -> Vec<Message> {
        self.shared
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One connection to a [`MemoryBroker`]
pub struct MemoryTransport {
    shared: Arc<BrokerShared>,
    connection: u64,
    events: broadcast::Sender<ConnectionEvent>,
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn publish(&self, message: Message) -> BridgeResult<()> {
        let targets: Vec<mpsc::Sender<Message>> = {
            let mut state = self.shared.lock();
            if state.published.len() == PUBLISHED_HISTORY {
                state.published.pop_front();
            }
            state.published.push_back(message.clone());
            if message.retained {
                if message.payload.is_empty() {
                    state.retained.remove(&message.topic);
                } else {
                    state
                        .retained
                        .insert(message.topic.clone(), message.clone());
                }
            }
            state
                .subscriptions
                .iter()
                .filter(|s| topic_matches(&s.filter, &message.topic))
                .map(|s| s.tx.clone())
                .collect()
        };

        trace!(topic = %message.topic, targets = targets.len(), "Memory broker publish");
        for tx in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(connection = self.connection, topic = %message.topic, "Subscriber queue full, dropping message");
                }
                // The subscription is being torn down
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> BridgeResult<mpsc::Receiver<Message>> {
        let (tx, rx) = mpsc::channel(self.shared.capacity);
        let mut state = self.shared.lock();
        *state.subscribe_calls.entry(topic.to_string()).or_insert(0) += 1;

        for retained in state.retained.values() {
            if topic_matches(topic, &retained.topic) {
                let _ = tx.try_send(retained.clone());
            }
        }

        state.subscriptions.push(BrokerSubscription {
            connection: self.connection,
            filter: topic.to_string(),
            tx,
        });
        debug!(connection = self.connection, topic, "Memory broker subscribe");
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> BridgeResult<()> {
        let mut state = self.shared.lock();
        *state
            .unsubscribe_calls
            .entry(topic.to_string())
            .or_insert(0) += 1;
        let connection = self.connection;
        state
            .subscriptions
            .retain(|s| !(s.connection == connection && s.filter == topic));
        debug!(connection, topic, "Memory broker unsubscribe");
        Ok(())
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriptions() {
        let broker = MemoryBroker::new();
        let a = broker.connect();
        let b = broker.connect();

        let mut rx = a.subscribe("zigbee/+/state", QoS::AtMostOnce).await.unwrap();
        b.publish(Message::new("zigbee/lamp/state", "on"))
            .await
            .unwrap();
        b.publish(Message::new("zigbee/lamp/power", "5"))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic, "zigbee/lamp/state");
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_retained_replayed() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        conn.publish(Message::new("hvac/mode", "heat").with_retained(true))
            .await
            .unwrap();

        let mut rx = conn.subscribe("hvac/#", QoS::AtLeastOnce).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.payload_str(), Some("heat"));
    }

    #[tokio::test]
    async fn test_full_subscription_does_not_block_publish() {
        let broker = MemoryBroker::with_capacity(1);
        let conn = broker.connect();
        let _stuck = conn.subscribe("slow", QoS::AtMostOnce).await.unwrap();
        let mut fast = conn.subscribe("fast", QoS::AtMostOnce).await.unwrap();

        for n in 0..5 {
            tokio::time::timeout(
                std::time::Duration::from_secs(1),
                conn.publish(Message::new("slow", n.to_string())),
            )
            .await
            .expect("publish waited on a full subscription")
            .unwrap();
        }
        conn.publish(Message::new("fast", "go")).await.unwrap();
        assert_eq!(fast.recv().await.unwrap().payload_str(), Some("go"));
    }

    #[tokio::test]
    async fn test_published_history_is_bounded() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        for n in 0..PUBLISHED_HISTORY + 10 {
            conn.publish(Message::new("t", n.to_string())).await.unwrap();
        }
        let published = broker.published();
        assert_eq!(published.len(), PUBLISHED_HISTORY);
        assert_eq!(published[0].payload_str(), Some("10"));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_per_connection() {
        let broker = MemoryBroker::new();
        let a = broker.connect();
        let b = broker.connect();
        let _rx_a = a.subscribe("t", QoS::AtMostOnce).await.unwrap();
        let _rx_b = b.subscribe("t", QoS::AtMostOnce).await.unwrap();

        a.unsubscribe("t").await.unwrap();
        assert_eq!(broker.active_subscriptions("t"), 1);
        assert_eq!(broker.subscribe_count("t"), 2);
        assert_eq!(broker.unsubscribe_count("t"), 1);
    }
}
