//! Automation engine
//!
//! Rules are declarative trigger → condition → action units, one YAML file
//! each:
//!
//! - **Trigger**: an event pattern on the bus or a topic on the broker bridge
//! - **Condition**: an optional query, answered by whichever integration owns
//!   the device, compared against an expected value
//! - **Actions**: control commands sent to devices in lexical key order, with
//!   a short pause between them
//!
//! Each enabled rule runs as its own task. Rules can be listed and toggled
//! remotely over the bridge; see [`control`].
//!
//! # Key Types
//!
//! - [`Rule`] - A validated rule
//! - [`RuleStore`] - Loads rules and persists their enabled flag
//! - [`RuleEngine`] - Runs enabled rules

pub mod condition;
pub mod control;
pub mod engine;
pub mod rule;
pub mod store;

use aghast_bridge::BridgeError;
use aghast_core::NameError;
use aghast_event_bus::{BusError, RegistryError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub use condition::{compare, Operator};
pub use control::{start_control, CHANGE_ENABLED_REQUEST, LIST_REPLY, LIST_REQUEST};
pub use engine::{EngineConfig, RuleEngine, RuleSummary};
pub use rule::{
    ActionGroup, Condition, ControlSetting, Dispatch, Rule, RuleConfig, Trigger, Via,
};
pub use store::RuleStore;

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Rule not found: {0}")]
    NotFound(String),

    #[error("Invalid rule configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("No reply to query '{query}' within {after:?}")]
    QueryTimeout { query: String, after: Duration },

    #[error("Query '{query}' was dropped without a reply")]
    NoReply { query: String },

    #[error("Reply to '{query}' has no field '{key}'")]
    MissingKey { query: String, key: String },

    #[error("Invalid name: {0}")]
    Name(#[from] NameError),

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Subscriber registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type AutomationResult<T> = Result<T, AutomationError>;
