//! Broker bridge for the aghast hub
//!
//! Connects local consumers to an upstream publish/subscribe broker. Many
//! local queues may listen on the same topic while the broker sees a single
//! subscription; the last queue to leave tears it down.
//!
//! The broker itself sits behind [`BrokerTransport`]. [`MemoryBroker`] is an
//! in-process implementation, and with the `mqtt` feature [`MqttTransport`]
//! talks to a real MQTT broker.

mod bridge;
mod filter;
mod memory;
#[cfg(feature = "mqtt")]
mod mqtt;
mod queue;
mod transport;

use std::time::Duration;
use thiserror::Error;

pub use bridge::{Bridge, BridgeConfig, RequestEnvelope, DEFAULT_OUTBOUND_CAPACITY};
pub use filter::topic_matches;
pub use memory::{MemoryBroker, MemoryTransport, PUBLISHED_HISTORY};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConnectOptions, MqttTransport};
pub use queue::{LocalQueue, QueueHandle, DEFAULT_QUEUE_CAPACITY};
pub use transport::{BrokerTransport, ConnectionEvent};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid topic: '{0}'")]
    InvalidTopic(String),

    #[error("Invalid broker address: '{0}'")]
    InvalidAddress(String),

    #[error("Broker transport error: {0}")]
    Transport(String),

    #[error("No reply on '{topic}' within {after:?}")]
    Timeout { topic: String, after: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bridge closed")]
    Closed,
}

pub type BridgeResult<T> = Result<T, BridgeError>;
