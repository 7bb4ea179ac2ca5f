//! Event types for the aghast event bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::name::{EventName, NameError};

/// Errors raised when answering a query event
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("a reply was already sent on this channel")]
    ReplyAlreadySent,

    #[error("the requester is no longer waiting for a reply")]
    RequesterGone,
}

/// Scalar payload carried by events, messages and rule settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Primitive {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Primitive {
    /// Interpret a textual payload: booleans, then numbers, then plain text
    pub fn parse_text(text: &str) -> Self {
        let trimmed = text.trim();
        match trimmed {
            "" => Primitive::Null,
            "true" => Primitive::Bool(true),
            "false" => Primitive::Bool(false),
            _ => trimmed
                .parse::<f64>()
                .map(Primitive::Number)
                .unwrap_or_else(|_| Primitive::Text(text.to_string())),
        }
    }

    /// Convert a JSON scalar; arrays and objects have no primitive form
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(Primitive::Null),
            serde_json::Value::Bool(b) => Some(Primitive::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Primitive::Number),
            serde_json::Value::String(s) => Some(Primitive::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Primitive::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Primitive::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Primitive::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Short type label used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Primitive::Null => "null",
            Primitive::Bool(_) => "bool",
            Primitive::Number(_) => "number",
            Primitive::Text(_) => "text",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::Null => Ok(()),
            Primitive::Bool(b) => write!(f, "{}", b),
            Primitive::Number(n) => write!(f, "{}", n),
            Primitive::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Primitive {
    fn from(value: bool) -> Self {
        Primitive::Bool(value)
    }
}

impl From<f64> for Primitive {
    fn from(value: f64) -> Self {
        Primitive::Number(value)
    }
}

impl From<i64> for Primitive {
    fn from(value: i64) -> Self {
        Primitive::Number(value as f64)
    }
}

impl From<&str> for Primitive {
    fn from(value: &str) -> Self {
        Primitive::Text(value.to_string())
    }
}

impl From<String> for Primitive {
    fn from(value: String) -> Self {
        Primitive::Text(value)
    }
}

/// One-shot reply slot attached to a query event
///
/// Clones share the slot, so however many subscribers receive the query,
/// at most one reply reaches the requester.
#[derive(Clone)]
pub struct ReplyChannel {
    slot: Arc<Mutex<Option<oneshot::Sender<Primitive>>>>,
}

impl ReplyChannel {
    /// Create a reply channel and the receiver the requester waits on
    pub fn new() -> (Self, oneshot::Receiver<Primitive>) {
        let (tx, rx) = oneshot::channel();
        let channel = Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (channel, rx)
    }

    /// Write the reply; only the first call succeeds
    pub fn reply(&self, value: impl Into<Primitive>) -> Result<(), EventError> {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(EventError::ReplyAlreadySent)?;
        sender
            .send(value.into())
            .map_err(|_| EventError::RequesterGone)
    }

    /// Whether a reply has already been written
    pub fn is_spent(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

impl fmt::Debug for ReplyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyChannel")
            .field("spent", &self.is_spent())
            .finish()
    }
}

/// Event payload: a plain value, or a reply slot for query-style events
#[derive(Debug, Clone)]
pub enum EventValue {
    Primitive(Primitive),
    Reply(ReplyChannel),
}

impl EventValue {
    pub fn as_primitive(&self) -> Option<&Primitive> {
        match self {
            EventValue::Primitive(p) => Some(p),
            EventValue::Reply(_) => None,
        }
    }

    pub fn as_reply(&self) -> Option<&ReplyChannel> {
        match self {
            EventValue::Reply(r) => Some(r),
            EventValue::Primitive(_) => None,
        }
    }
}

impl From<Primitive> for EventValue {
    fn from(value: Primitive) -> Self {
        EventValue::Primitive(value)
    }
}

macro_rules! event_value_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for EventValue {
                fn from(value: $ty) -> Self {
                    EventValue::Primitive(value.into())
                }
            }
        )*
    };
}

event_value_from!(bool, f64, i64, &str, String);

impl From<ReplyChannel> for EventValue {
    fn from(channel: ReplyChannel) -> Self {
        EventValue::Reply(channel)
    }
}

/// An event that can be published on the event bus
#[derive(Debug, Clone)]
pub struct Event {
    /// Hierarchical name the bus routes on
    pub name: EventName,

    /// Payload
    pub value: EventValue,

    /// When the event was created
    pub time_fired: DateTime<Utc>,
}

impl Event {
    pub fn new(name: EventName, value: impl Into<EventValue>) -> Self {
        Self {
            name,
            value: value.into(),
            time_fired: Utc::now(),
        }
    }

    /// Parse `name` and build an event
    pub fn try_new(name: &str, value: impl Into<EventValue>) -> Result<Self, NameError> {
        Ok(Self::new(EventName::new(name)?, value))
    }

    /// Build a query event together with the receiver for its single reply
    pub fn query(name: EventName) -> (Self, oneshot::Receiver<Primitive>) {
        let (channel, rx) = ReplyChannel::new();
        (Self::new(name, channel), rx)
    }

    pub fn is_query(&self) -> bool {
        matches!(self.value, EventValue::Reply(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text() {
        assert_eq!(Primitive::parse_text("true"), Primitive::Bool(true));
        assert_eq!(Primitive::parse_text(" 72.5 "), Primitive::Number(72.5));
        assert_eq!(Primitive::parse_text("on"), Primitive::Text("on".into()));
        assert_eq!(Primitive::parse_text(""), Primitive::Null);
    }

    #[test]
    fn test_primitive_yaml_forms() {
        let values: Vec<Primitive> = serde_json::from_str(r#"[true, 21.5, "heat", null]"#).unwrap();
        assert_eq!(
            values,
            vec![
                Primitive::Bool(true),
                Primitive::Number(21.5),
                Primitive::Text("heat".into()),
                Primitive::Null,
            ]
        );
    }

    #[tokio::test]
    async fn test_reply_channel_single_reply() {
        let name = EventName::new("Virtual/Query/Lamp/IsOn").unwrap();
        let (event, rx) = Event::query(name);
        assert!(event.is_query());

        let copy = event.clone();
        let reply = event.value.as_reply().unwrap();
        reply.reply(true).unwrap();

        let second = copy.value.as_reply().unwrap().reply(false);
        assert_eq!(second, Err(EventError::ReplyAlreadySent));
        assert_eq!(rx.await.unwrap(), Primitive::Bool(true));
    }

    #[test]
    fn test_reply_after_requester_dropped() {
        let (channel, rx) = ReplyChannel::new();
        drop(rx);
        assert_eq!(channel.reply(1.0), Err(EventError::RequesterGone));
        assert!(channel.is_spent());
    }
}
