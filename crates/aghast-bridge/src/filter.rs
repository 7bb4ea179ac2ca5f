//! Broker topic filter matching
//!
//! Broker filters follow the usual conventions: `+` matches exactly one
//! level and a trailing `#` matches the remaining levels, including none.

/// Check whether a broker `topic` matches `filter`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact() {
        assert!(topic_matches("aghast/automation/client/list", "aghast/automation/client/list"));
        assert!(!topic_matches("aghast/automation/client/list", "aghast/automation/client"));
    }

    #[test]
    fn test_single_level() {
        assert!(topic_matches("zigbee/+/state", "zigbee/lamp/state"));
        assert!(!topic_matches("zigbee/+/state", "zigbee/lamp/power/state"));
    }

    #[test]
    fn test_multi_level() {
        assert!(topic_matches("zigbee/#", "zigbee/lamp/state"));
        assert!(topic_matches("zigbee/#", "zigbee"));
        assert!(!topic_matches("zigbee/#/state", "zigbee/lamp/state"));
        assert!(!topic_matches("zigbee/#", "tasmota/plug"));
    }
}
