//! The seam between the bridge and a concrete broker client

use aghast_core::{Message, QoS};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::BridgeResult;

/// Connection state changes reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Lost(String),
}

/// One connection to an upstream publish/subscribe broker
///
/// The bridge calls `subscribe` at most once per topic and expects every
/// broker message matching that topic filter on the returned receiver. After
/// `unsubscribe` the transport drops the sender, closing the receiver.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Publish one message to the broker
    async fn publish(&self, message: Message) -> BridgeResult<()>;

    /// Issue a broker-level subscription for `topic`
    async fn subscribe(&self, topic: &str, qos: QoS) -> BridgeResult<mpsc::Receiver<Message>>;

    /// Issue a broker-level unsubscribe for `topic`
    async fn unsubscribe(&self, topic: &str) -> BridgeResult<()>;

    /// Stream of connection state changes
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
}
