//! Rule definitions
//!
//! A rule file deserializes into a [`RuleConfig`], which stays close to the
//! YAML so that a broken file still parses far enough to be reported by name.
//! [`Rule::from_config`] validates it into the form the engine runs.
//!
//! ```yaml
//! name: Lounge too cold
//! description: Turn on the heater when the lounge drops below 19
//! enabled: true
//! trigger:
//!   event: Virtual/Sensor/Lounge/+
//! condition:
//!   source: event
//!   query: Virtual/Query/Lounge/FetchLast
//!   operator: "<"
//!   value: 19
//! actions:
//!   "1":
//!     target: Virtual/Heater
//!     controls:
//!       - control: Power
//!         setting: true
//!       - control: Setpoint
//!         setting: 21
//! ```

use aghast_core::{control_event_name, EventName, Primitive, TopicPattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::condition::Operator;
use crate::{AutomationError, AutomationResult};

/// Which channel a trigger, condition or action goes through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Via {
    /// The in-process event bus
    #[default]
    Event,
    /// The broker bridge
    Message,
}

/// `trigger:` as written; exactly one of the two keys must be set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub source: Via,
    pub query: Option<String>,
    /// Field to read when the reply is a JSON object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub operator: Option<String>,
    pub value: Option<Primitive>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSetting {
    pub control: String,
    #[serde(default)]
    pub setting: Primitive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionGroupConfig {
    /// `Integration/Device` for event actions, a topic prefix for messages
    pub target: String,
    #[serde(default)]
    pub via: Via,
    #[serde(default)]
    pub controls: Vec<ControlSetting>,
}

/// One rule file as written
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: Option<TriggerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionConfig>,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionGroupConfig>,
}

fn default_enabled() -> bool {
    true
}

/// What wakes a rule up
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Events matching a bus pattern
    Event(TopicPattern),
    /// Messages on a broker topic filter
    Message(String),
}

impl Trigger {
    pub fn via(&self) -> Via {
        match self {
            Trigger::Event(_) => Via::Event,
            Trigger::Message(_) => Via::Message,
        }
    }

    pub fn pattern(&self) -> &str {
        match self {
            Trigger::Event(pattern) => pattern.as_str(),
            Trigger::Message(topic) => topic,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub source: Via,
    /// Query event name, or request topic for message queries
    pub query: String,
    pub key: Option<String>,
    pub operator: Operator,
    pub expected: Primitive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionGroup {
    pub target: String,
    pub via: Via,
    pub controls: Vec<ControlSetting>,
}

/// One outbound command produced by a rule's actions
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Event { name: EventName, setting: Primitive },
    Message { topic: String, setting: Primitive },
}

impl ActionGroup {
    fn dispatch_for(&self, control: &ControlSetting) -> AutomationResult<Dispatch> {
        match self.via {
            Via::Event => {
                let (integration, device) = split_target(&self.target)?;
                let name = control_event_name(integration, device, &control.control).map_err(|e| {
                    AutomationError::InvalidConfig(format!(
                        "action '{}/{}': {}",
                        self.target, control.control, e
                    ))
                })?;
                Ok(Dispatch::Event {
                    name,
                    setting: control.setting.clone(),
                })
            }
            Via::Message => {
                if control.control.is_empty() {
                    return Err(AutomationError::InvalidConfig(format!(
                        "action on '{}' has an empty control",
                        self.target
                    )));
                }
                Ok(Dispatch::Message {
                    topic: format!("{}/{}", self.target.trim_end_matches('/'), control.control),
                    setting: control.setting.clone(),
                })
            }
        }
    }
}

fn split_target(target: &str) -> AutomationResult<(&str, &str)> {
    match target.split_once('/') {
        Some((integration, device))
            if !integration.is_empty() && !device.is_empty() && !device.contains('/') =>
        {
            Ok((integration, device))
        }
        _ => Err(AutomationError::InvalidConfig(format!(
            "event action target '{}' is not Integration/Device",
            target
        ))),
    }
}

/// A validated rule
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    /// File the rule was loaded from
    pub source: PathBuf,
    pub trigger: Trigger,
    pub condition: Option<Condition>,
    actions: BTreeMap<String, ActionGroup>,
    dispatches: Vec<Dispatch>,
}

impl Rule {
    pub fn from_config(config: RuleConfig, source: impl AsRef<Path>) -> AutomationResult<Self> {
        let invalid = |reason: String| AutomationError::InvalidConfig(reason);

        let name = config.name.trim().to_string();
        if name.is_empty() {
            return Err(invalid("rule has no name".into()));
        }

        let trigger = match config.trigger {
            None
            | Some(TriggerConfig {
                event: None,
                message: None,
            }) => return Err(invalid(format!("rule '{}' has no trigger", name))),
            Some(TriggerConfig {
                event: Some(_),
                message: Some(_),
            }) => {
                return Err(invalid(format!(
                    "rule '{}' trigger sets both event and message",
                    name
                )))
            }
            Some(TriggerConfig {
                event: Some(pattern),
                message: None,
            }) => Trigger::Event(
                TopicPattern::new(pattern)
                    .map_err(|e| invalid(format!("rule '{}' trigger: {}", name, e)))?,
            ),
            Some(TriggerConfig {
                event: None,
                message: Some(topic),
            }) => {
                if topic.trim().is_empty() {
                    return Err(invalid(format!("rule '{}' has an empty trigger topic", name)));
                }
                Trigger::Message(topic)
            }
        };

        let condition = config
            .condition
            .map(|c| validate_condition(&name, c))
            .transpose()?;

        let actions: BTreeMap<String, ActionGroup> = config
            .actions
            .into_iter()
            .map(|(key, group)| {
                (
                    key,
                    ActionGroup {
                        target: group.target,
                        via: group.via,
                        controls: group.controls,
                    },
                )
            })
            .collect();

        // BTreeMap iteration gives the lexical key order actions run in
        let mut dispatches = Vec::new();
        for group in actions.values() {
            for control in &group.controls {
                dispatches.push(
                    group
                        .dispatch_for(control)
                        .map_err(|e| invalid(format!("rule '{}': {}", name, e)))?,
                );
            }
        }

        Ok(Self {
            name,
            description: config.description,
            enabled: config.enabled,
            source: source.as_ref().to_path_buf(),
            trigger,
            condition,
            actions,
            dispatches,
        })
    }

    /// Action groups keyed as written, in lexical key order
    pub fn actions(&self) -> &BTreeMap<String, ActionGroup> {
        &self.actions
    }

    /// Every command the rule sends when it fires, in dispatch order
    pub fn dispatches(&self) -> &[Dispatch] {
        &self.dispatches
    }
}

fn validate_condition(rule: &str, config: ConditionConfig) -> AutomationResult<Condition> {
    let missing =
        |field: &str| AutomationError::InvalidConfig(format!("rule '{}' condition has no {}", rule, field));

    let query = config
        .query
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| missing("query"))?;
    if config.source == Via::Event {
        EventName::new(query.as_str()).map_err(|e| {
            AutomationError::InvalidConfig(format!("rule '{}' condition query: {}", rule, e))
        })?;
    }

    let operator = config
        .operator
        .ok_or_else(|| missing("operator"))?
        .parse::<Operator>()
        .map_err(|e| AutomationError::InvalidConfig(format!("rule '{}' condition: {}", rule, e)))?;

    let expected = match config.value {
        None | Some(Primitive::Null) => return Err(missing("value")),
        Some(value) => value,
    };

    Ok(Condition {
        source: config.source,
        query,
        key: config.key,
        operator,
        expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> AutomationResult<Rule> {
        let config: RuleConfig = serde_yaml::from_str(yaml).unwrap();
        Rule::from_config(config, "test.yaml")
    }

    #[test]
    fn test_full_rule() {
        let rule = parse(
            r#"
name: Lounge too cold
description: heat it up
trigger:
  event: Virtual/Sensor/Lounge/+
condition:
  query: Virtual/Query/Lounge/FetchLast
  operator: "<"
  value: 19
actions:
  "2":
    target: zigbee/lamp
    via: message
    controls:
      - control: set
        setting: "ON"
  "1":
    target: Virtual/Heater
    controls:
      - control: Power
        setting: true
      - control: Setpoint
        setting: 21
"#,
        )
        .unwrap();

        assert!(rule.enabled);
        assert_eq!(rule.trigger.via(), Via::Event);
        let condition = rule.condition.as_ref().unwrap();
        assert_eq!(condition.operator, Operator::Lt);
        assert_eq!(condition.expected, Primitive::Number(19.0));

        assert_eq!(
            rule.dispatches(),
            &[
                Dispatch::Event {
                    name: EventName::new("Virtual/Control/Heater/Power").unwrap(),
                    setting: Primitive::Bool(true),
                },
                Dispatch::Event {
                    name: EventName::new("Virtual/Control/Heater/Setpoint").unwrap(),
                    setting: Primitive::Number(21.0),
                },
                Dispatch::Message {
                    topic: "zigbee/lamp/set".to_string(),
                    setting: Primitive::Text("ON".into()),
                },
            ]
        );
    }

    #[test]
    fn test_lexical_group_order() {
        let rule = parse(
            r#"
name: ordering
trigger:
  message: buttons/hall
actions:
  "2": { target: A/two, controls: [ { control: C } ] }
  "10": { target: A/ten, controls: [ { control: C } ] }
  "1": { target: A/one, controls: [ { control: C } ] }
"#,
        )
        .unwrap();

        let names: Vec<&str> = rule
            .dispatches()
            .iter()
            .map(|d| match d {
                Dispatch::Event { name, .. } => name.as_str(),
                Dispatch::Message { topic, .. } => topic.as_str(),
            })
            .collect();
        assert_eq!(
            names,
            ["A/Control/one/C", "A/Control/ten/C", "A/Control/two/C"]
        );
    }

    #[test]
    fn test_missing_trigger() {
        let err = parse("name: nothing\n").unwrap_err();
        assert!(err.to_string().contains("no trigger"));
    }

    #[test]
    fn test_incomplete_condition() {
        let err = parse(
            r#"
name: half
trigger: { event: A/B/C/D }
condition:
  query: A/Query/C/IsOn
  value: true
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("operator"));
    }

    #[test]
    fn test_bad_event_target() {
        let err = parse(
            r#"
name: bad
trigger: { event: A/B/C/D }
actions:
  "1": { target: JustOneSegment, controls: [ { control: Power, setting: true } ] }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, AutomationError::InvalidConfig(_)));
    }

    #[test]
    fn test_trigger_map_forms() {
        let rule = parse("name: ev\ntrigger:\n  event: Virtual/Sensor/+/Motion\n").unwrap();
        assert_eq!(rule.trigger, Trigger::Event(TopicPattern::new("Virtual/Sensor/+/Motion").unwrap()));

        let rule = parse("name: msg\ntrigger:\n  message: buttons/hall\n").unwrap();
        assert_eq!(rule.trigger, Trigger::Message("buttons/hall".to_string()));
    }

    #[test]
    fn test_trigger_needs_exactly_one_source() {
        let err = parse("name: both\ntrigger: { event: A/B/C/D, message: t }\n").unwrap_err();
        assert!(err.to_string().contains("both"));

        let err = parse("name: neither\ntrigger: {}\n").unwrap_err();
        assert!(err.to_string().contains("no trigger"));
    }

    #[test]
    fn test_actions_accessor_matches_dispatches() {
        let rule = parse(
            r#"
name: grouped
trigger: { event: A/B/C/D }
actions:
  b: { target: A/two, controls: [ { control: C } ] }
  a: { target: A/one, controls: [ { control: C }, { control: D } ] }
"#,
        )
        .unwrap();
        let keys: Vec<&str> = rule.actions().keys().map(String::as_str).collect();
        assert_eq!(keys, ["a", "b"]);
        let controls: usize = rule.actions().values().map(|g| g.controls.len()).sum();
        assert_eq!(controls, rule.dispatches().len());
    }

    #[test]
    fn test_disabled_flag() {
        let rule = parse("name: off\nenabled: false\ntrigger: { message: t }\n").unwrap();
        assert!(!rule.enabled);
        assert!(rule.dispatches().is_empty());
    }
}
