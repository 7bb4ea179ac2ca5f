//! Subscription multiplexing over one broker connection

use aghast_core::{Message, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use ulid::Ulid;

use crate::queue::{LocalQueue, QueueHandle, DEFAULT_QUEUE_CAPACITY};
use crate::transport::{BrokerTransport, ConnectionEvent};
use crate::{BridgeError, BridgeResult};

/// Default capacity of the outbound publish queue
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Queue sizing and subscription QoS for a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    pub queue_capacity: usize,
    pub outbound_capacity: usize,
    pub subscribe_qos: QoS,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            subscribe_qos: QoS::AtMostOnce,
        }
    }
}

/// Payload of a request published by [`Bridge::request`]
///
/// Responders publish exactly one message to `reply_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub reply_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Per-topic binding: the local queues and the task fanning out to them
struct TopicEntry {
    queues: Vec<QueueHandle>,
    fan_out: JoinHandle<()>,
}

type TopicTable = RwLock<HashMap<String, TopicEntry>>;

/// Handle to one broker connection and its topic table
///
/// Exactly one broker-level subscription exists per topic, however many local
/// queues are attached to it. Clones share the table.
#[derive(Clone)]
pub struct Bridge {
    transport: Arc<dyn BrokerTransport>,
    topics: Arc<TopicTable>,
    outbound: mpsc::Sender<Message>,
    config: BridgeConfig,
}

impl Bridge {
    /// Wrap a transport and spawn the outbound publisher task
    ///
    /// Returns the bridge and the outbound queue; every message sent on the
    /// queue is published to the broker in order.
    pub fn start(
        transport: Arc<dyn BrokerTransport>,
        config: BridgeConfig,
    ) -> (Self, mpsc::Sender<Message>) {
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(config.outbound_capacity.max(1));

        let publisher = transport.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                trace!(topic = %message.topic, "Publishing to broker");
                if let Err(e) = publisher.publish(message).await {
                    warn!(error = %e, "Broker publish failed");
                }
            }
            debug!("Bridge outbound publisher stopped");
        });

        let bridge = Self {
            transport,
            topics: Arc::new(RwLock::new(HashMap::new())),
            outbound: outbound.clone(),
            config,
        };
        (bridge, outbound)
    }

    /// A new sender on the outbound queue
    pub fn outbound(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }

    /// Queue a message for publishing
    pub async fn publish(&self, message: Message) -> BridgeResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| BridgeError::Closed)
    }

    /// Connection state changes of the underlying transport
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.transport.connection_events()
    }

    /// Attach a fresh local queue to `topic`
    pub async fn subscribe_to_topic(&self, topic: &str) -> BridgeResult<LocalQueue> {
        let queue = LocalQueue::new(self.config.queue_capacity);
        self.subscribe_to_topic_using_chan(topic, &queue.handle())
            .await?;
        Ok(queue)
    }

    /// Attach an existing local queue to `topic`
    ///
    /// The first queue for a topic issues the broker-level subscribe and
    /// starts the topic's fan-out task. The check and the subscribe happen
    /// under the table's write lock.
    pub async fn subscribe_to_topic_using_chan(
        &self,
        topic: &str,
        queue: &QueueHandle,
    ) -> BridgeResult<()> {
        if topic.is_empty() {
            return Err(BridgeError::InvalidTopic(topic.to_string()));
        }

        let mut topics = self.topics.write().await;
        if let Some(entry) = topics.get_mut(topic) {
            entry.queues.push(queue.clone());
            debug!(topic, queues = entry.queues.len(), "Attached queue to topic");
            return Ok(());
        }

        let upstream = self
            .transport
            .subscribe(topic, self.config.subscribe_qos)
            .await?;
        let fan_out = tokio::spawn(fan_out(
            topic.to_string(),
            upstream,
            Arc::downgrade(&self.topics),
            self.transport.clone(),
        ));
        topics.insert(
            topic.to_string(),
            TopicEntry {
                queues: vec![queue.clone()],
                fan_out,
            },
        );
        info!(topic, "Subscribed to broker topic");
        Ok(())
    }

    /// Detach `queue` from `topic`
    ///
    /// Detaching the last queue unsubscribes from the broker. An unknown
    /// topic or queue is logged and ignored.
    pub async fn unsubscribe_from_topic(&self, topic: &str, queue: &QueueHandle) -> BridgeResult<()> {
        let mut topics = self.topics.write().await;
        let Some(entry) = topics.get_mut(topic) else {
            warn!(topic, "Unsubscribe from topic with no local queues");
            return Ok(());
        };

        let Some(position) = entry.queues.iter().position(|q| q == queue) else {
            warn!(topic, "Unsubscribe of a queue not attached to topic");
            return Ok(());
        };
        entry.queues.remove(position);

        if !entry.queues.is_empty() {
            debug!(topic, queues = entry.queues.len(), "Detached queue from topic");
            return Ok(());
        }

        if let Some(entry) = topics.remove(topic) {
            entry.fan_out.abort();
        }
        self.transport.unsubscribe(topic).await?;
        info!(topic, "Unsubscribed from broker topic");
        Ok(())
    }

    /// One-shot request/reply
    ///
    /// Subscribes a unique reply topic under `topic`, publishes a
    /// [`RequestEnvelope`] to `topic`, waits for a single reply and detaches.
    /// `timeout` of `None` waits indefinitely.
    pub async fn request(
        &self,
        topic: &str,
        payload: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> BridgeResult<Message> {
        let reply_to = format!("{}/reply/{}", topic, Ulid::new());
        let mut queue = self.subscribe_to_topic(&reply_to).await?;

        let envelope = RequestEnvelope {
            reply_to: reply_to.clone(),
            payload,
        };
        let outcome = match Message::json(topic, &envelope) {
            Ok(request) => match self.publish(request).await {
                Ok(()) => wait_for_reply(&mut queue, topic, timeout).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(BridgeError::Json(e)),
        };

        self.unsubscribe_from_topic(&reply_to, &queue.handle())
            .await?;
        outcome
    }

    /// Number of topics with a live broker subscription
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Number of local queues attached to `topic`
    pub async fn queue_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|e| e.queues.len())
            .unwrap_or(0)
    }
}

async fn wait_for_reply(
    queue: &mut LocalQueue,
    topic: &str,
    timeout: Option<Duration>,
) -> BridgeResult<Message> {
    let reply = match timeout {
        Some(limit) => tokio::time::timeout(limit, queue.recv())
            .await
            .map_err(|_| BridgeError::Timeout {
                topic: topic.to_string(),
                after: limit,
            })?,
        None => queue.recv().await,
    };
    reply.ok_or(BridgeError::Closed)
}

/// Push every broker message for `topic` to each attached queue in order
///
/// The queue list is copied under the read lock and pushed outside it, so a
/// consumer that stops reading stalls this topic only and never blocks
/// subscribe or unsubscribe. Queues whose receiver was dropped are pruned.
async fn fan_out(
    topic: String,
    mut upstream: mpsc::Receiver<Message>,
    topics: Weak<TopicTable>,
    transport: Arc<dyn BrokerTransport>,
) {
    while let Some(message) = upstream.recv().await {
        let Some(table) = topics.upgrade() else {
            break;
        };
        let queues: Vec<QueueHandle> = match table.read().await.get(&topic) {
            Some(entry) => entry.queues.clone(),
            None => break,
        };
        drop(table);

        let mut closed = 0;
        for queue in &queues {
            if queue.is_closed() || queue.send(message.clone()).await.is_err() {
                closed += 1;
            }
        }
        if closed == 0 {
            continue;
        }

        let Some(table) = topics.upgrade() else {
            break;
        };
        if prune_closed(&topic, &table, transport.as_ref()).await {
            break;
        }
    }
    debug!(topic = %topic, "Fan-out task stopped");
}

/// Drop closed queues from `topic`; true when the topic lost its last queue
///
/// The broker unsubscribe happens under the write lock, like
/// [`Bridge::unsubscribe_from_topic`].
async fn prune_closed(topic: &str, table: &TopicTable, transport: &dyn BrokerTransport) -> bool {
    let mut topics = table.write().await;
    let Some(entry) = topics.get_mut(topic) else {
        return true;
    };
    let before = entry.queues.len();
    entry.queues.retain(|q| !q.is_closed());
    warn!(
        topic,
        pruned = before - entry.queues.len(),
        "Dropped local queues closed without unsubscribing"
    );
    if !entry.queues.is_empty() {
        return false;
    }

    // The entry holds this task's own handle; dropping it detaches the task
    topics.remove(topic);
    if let Err(e) = transport.unsubscribe(topic).await {
        warn!(topic, error = %e, "Broker unsubscribe failed");
    }
    info!(topic, "Unsubscribed from broker topic");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn bridge_on(broker: &MemoryBroker) -> Bridge {
        let (bridge, _outbound) = Bridge::start(Arc::new(broker.connect()), BridgeConfig::default());
        bridge
    }

    #[tokio::test]
    async fn test_reference_counted_broker_subscription() {
        let broker = MemoryBroker::new();
        let bridge = bridge_on(&broker);

        let q1 = bridge.subscribe_to_topic("T").await.unwrap();
        let q2 = bridge.subscribe_to_topic("T").await.unwrap();
        let q3 = bridge.subscribe_to_topic("T").await.unwrap();
        assert_eq!(broker.subscribe_count("T"), 1);
        assert_eq!(bridge.queue_count("T").await, 3);

        bridge.unsubscribe_from_topic("T", &q1.handle()).await.unwrap();
        bridge.unsubscribe_from_topic("T", &q2.handle()).await.unwrap();
        assert_eq!(broker.unsubscribe_count("T"), 0);
        assert_eq!(broker.active_subscriptions("T"), 1);

        bridge.unsubscribe_from_topic("T", &q3.handle()).await.unwrap();
        assert_eq!(broker.unsubscribe_count("T"), 1);
        assert_eq!(broker.active_subscriptions("T"), 0);
        assert_eq!(bridge.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_every_queue_in_order() {
        let broker = MemoryBroker::new();
        let bridge = bridge_on(&broker);
        let mut q1 = bridge.subscribe_to_topic("sensors/temp").await.unwrap();
        let mut q2 = bridge.subscribe_to_topic("sensors/temp").await.unwrap();

        for n in 0..5 {
            bridge
                .publish(Message::new("sensors/temp", n.to_string()))
                .await
                .unwrap();
        }

        for queue in [&mut q1, &mut q2] {
            for n in 0..5 {
                let received = queue.recv().await.unwrap();
                assert_eq!(received.payload_str(), Some(n.to_string().as_str()));
            }
        }
    }

    #[tokio::test]
    async fn test_shared_queue_across_topics() {
        let broker = MemoryBroker::new();
        let bridge = bridge_on(&broker);
        let mut queue = LocalQueue::new(10);
        bridge
            .subscribe_to_topic_using_chan("a", &queue.handle())
            .await
            .unwrap();
        bridge
            .subscribe_to_topic_using_chan("b", &queue.handle())
            .await
            .unwrap();

        bridge.publish(Message::new("a", "1")).await.unwrap();
        let first = queue.recv().await.unwrap();
        bridge.publish(Message::new("b", "2")).await.unwrap();
        let second = queue.recv().await.unwrap();

        assert_eq!(first.topic, "a");
        assert_eq!(second.topic, "b");
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_not_an_error() {
        let broker = MemoryBroker::new();
        let bridge = bridge_on(&broker);
        let stray = LocalQueue::new(1);

        bridge
            .unsubscribe_from_topic("nowhere", &stray.handle())
            .await
            .unwrap();

        let _attached = bridge.subscribe_to_topic("T").await.unwrap();
        bridge
            .unsubscribe_from_topic("T", &stray.handle())
            .await
            .unwrap();
        assert_eq!(bridge.queue_count("T").await, 1);
        assert_eq!(broker.unsubscribe_count("T"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_subscribers_share_one_broker_subscription() {
        let broker = MemoryBroker::new();
        let bridge = bridge_on(&broker);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let bridge = bridge.clone();
            tasks.push(tokio::spawn(async move {
                bridge.subscribe_to_topic("shared").await.unwrap()
            }));
        }
        let mut queues = Vec::new();
        for task in tasks {
            queues.push(task.await.unwrap());
        }

        assert_eq!(broker.subscribe_count("shared"), 1);
        assert_eq!(bridge.queue_count("shared").await, 8);
    }

    #[tokio::test]
    async fn test_request_reply() {
        let broker = MemoryBroker::new();
        let bridge = bridge_on(&broker);
        let responder = bridge_on(&broker);

        let mut requests = responder.subscribe_to_topic("hvac/query").await.unwrap();
        tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            let envelope: RequestEnvelope = request.payload_json().unwrap();
            responder
                .publish(Message::new(envelope.reply_to, "72.0"))
                .await
                .unwrap();
        });

        let reply = bridge
            .request("hvac/query", None, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply.payload_str(), Some("72.0"));
        assert_eq!(bridge.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_timeout_detaches_reply_topic() {
        let broker = MemoryBroker::new();
        let bridge = bridge_on(&broker);

        let err = bridge
            .request("nobody/home", None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
        assert_eq!(bridge.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_stuck_consumer_only_stalls_its_topic() {
        let broker = MemoryBroker::with_capacity(2);
        let (bridge, _) = Bridge::start(
            Arc::new(broker.connect()),
            BridgeConfig {
                queue_capacity: 1,
                ..BridgeConfig::default()
            },
        );
        let _slow = bridge.subscribe_to_topic("slow").await.unwrap();
        let mut fast = bridge.subscribe_to_topic("fast").await.unwrap();

        for n in 0..10 {
            bridge
                .publish(Message::new("slow", n.to_string()))
                .await
                .unwrap();
        }
        bridge.publish(Message::new("fast", "go")).await.unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(2), fast.recv())
            .await
            .expect("fast topic held up by the slow one")
            .unwrap();
        assert_eq!(delivered.payload_str(), Some("go"));
    }

    async fn settle(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_dropped_queue_is_pruned() {
        let broker = MemoryBroker::new();
        let bridge = bridge_on(&broker);
        let q1 = bridge.subscribe_to_topic("T").await.unwrap();
        let mut q2 = bridge.subscribe_to_topic("T").await.unwrap();

        drop(q1);
        bridge.publish(Message::new("T", "1")).await.unwrap();
        assert_eq!(q2.recv().await.unwrap().payload_str(), Some("1"));

        let mut pruned = false;
        for _ in 0..200 {
            if bridge.queue_count("T").await == 1 {
                pruned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pruned, "closed queue still attached");
        assert_eq!(broker.active_subscriptions("T"), 1);

        // Losing the last queue releases the broker subscription
        drop(q2);
        bridge.publish(Message::new("T", "2")).await.unwrap();
        settle(|| broker.active_subscriptions("T") == 0).await;
        assert_eq!(broker.unsubscribe_count("T"), 1);
        assert_eq!(bridge.topic_count().await, 0);
    }
}
