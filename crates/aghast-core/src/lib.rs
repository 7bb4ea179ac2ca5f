//! Core types for the aghast hub
//!
//! This crate provides the fundamental types shared by the event bus, the
//! broker bridge, the automation engine and integrations: Event, EventName,
//! TopicPattern and Message.

mod event;
mod message;
mod name;

pub use event::{Event, EventError, EventValue, Primitive, ReplyChannel};
pub use message::{Message, QoS};
pub use name::{EventName, NameError, TopicPattern, SEPARATOR, WILDCARD};

/// Reserved device types (second segment of an event name)
pub mod device_types {
    /// Addressable actions: `Integration/Control/Device/Control`
    pub const CONTROL: &str = "Control";

    /// Request/reply state fetches: `Integration/Query/Device/QueryName`
    pub const QUERY: &str = "Query";

    /// State reports published by integrations
    pub const SENSOR: &str = "Sensor";
}

/// Conventional query names (fourth segment of a `Query` event)
pub mod queries {
    pub const FETCH_LAST: &str = "FetchLast";
    pub const FETCH_LAST_INDEXED: &str = "FetchLastIndexed";
    pub const IS_AVAILABLE: &str = "IsAvailable";
    pub const IS_ON: &str = "IsOn";
}

/// Name of the control event addressed to `device` of `integration`
pub fn control_event_name(
    integration: &str,
    device: &str,
    control: &str,
) -> Result<EventName, NameError> {
    EventName::from_segments([integration, device_types::CONTROL, device, control])
}

/// Name of a query event addressed to `device` of `integration`
pub fn query_event_name(
    integration: &str,
    device: &str,
    query: &str,
) -> Result<EventName, NameError> {
    EventName::from_segments([integration, device_types::QUERY, device, query])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_event_name() {
        let name = control_event_name("Daikin", "Lounge", "Power").unwrap();
        assert_eq!(name.as_str(), "Daikin/Control/Lounge/Power");
    }

    #[test]
    fn test_query_event_name_rejects_empty_device() {
        assert!(query_event_name("Daikin", "", queries::IS_ON).is_err());
    }
}
