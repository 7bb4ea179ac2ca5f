//! Broker messages
//!
//! Messages travel through the external broker rather than the in-process
//! bus. Their payload is raw bytes; helpers decode it as text, JSON or a
//! [`Primitive`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::event::Primitive;

/// Broker delivery guarantee
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// A message published to or received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub qos: QoS,
    pub retained: bool,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            qos: QoS::default(),
            retained: false,
            payload: payload.into(),
        }
    }

    /// Message whose payload is the textual form of a primitive
    pub fn primitive(topic: impl Into<String>, value: &Primitive) -> Self {
        Self::new(topic, value.to_string())
    }

    /// Message with a JSON-serialized payload
    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(topic, serde_json::to_vec(value)?))
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    /// Payload as UTF-8 text, if valid
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn payload_json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    /// Decode the payload as a primitive
    ///
    /// JSON scalars are taken as-is; anything else falls back to
    /// [`Primitive::parse_text`].
    pub fn payload_primitive(&self) -> Primitive {
        if let Ok(value) = self.payload_json::<serde_json::Value>() {
            if let Some(p) = Primitive::from_json(&value) {
                return p;
            }
        }
        match self.payload_str() {
            Some(text) => Primitive::parse_text(text),
            None => Primitive::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_primitive() {
        assert_eq!(
            Message::new("t", "72.0").payload_primitive(),
            Primitive::Number(72.0)
        );
        assert_eq!(
            Message::new("t", "\"heat\"").payload_primitive(),
            Primitive::Text("heat".into())
        );
        assert_eq!(
            Message::new("t", "cool").payload_primitive(),
            Primitive::Text("cool".into())
        );
        assert_eq!(
            Message::new("t", "true").payload_primitive(),
            Primitive::Bool(true)
        );
    }

    #[test]
    fn test_json_message() {
        let msg = Message::json("aghast/x", &json!({"a": 1}))
            .unwrap()
            .with_qos(QoS::AtLeastOnce)
            .with_retained(true);
        assert_eq!(msg.qos.as_u8(), 1);
        assert!(msg.retained);
        let value: serde_json::Value = msg.payload_json().unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(QoS::from_u8(2), Some(QoS::ExactlyOnce));
        assert_eq!(QoS::from_u8(3), None);
    }
}
