//! Hub settings from `aghast.yaml`

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_yaml;

pub const HUB_CONFIG_FILE: &str = "aghast.yaml";

/// Upstream broker connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// `host:port`; without it the hub runs on an in-process broker
    pub address: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            address: None,
            username: None,
            password: None,
            client_id: "aghast".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub queue_capacity: usize,
    pub inbound_capacity: usize,
    pub max_subscribers: usize,
    /// Exit the process when a subscriber queue overflows
    pub fatal_on_overflow: bool,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            inbound_capacity: 1024,
            max_subscribers: 256,
            fatal_on_overflow: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationSettings {
    /// Rule directory, relative to the config directory unless absolute
    pub directory: PathBuf,
    pub action_pacing_ms: u64,
    /// `null` waits for condition replies indefinitely
    pub query_timeout_secs: Option<u64>,
    pub admin_prefix: String,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("automation"),
            action_pacing_ms: 100,
            query_timeout_secs: Some(10),
            admin_prefix: "aghast/automation/".to_string(),
        }
    }
}

impl AutomationSettings {
    pub fn action_pacing(&self) -> Duration {
        Duration::from_millis(self.action_pacing_ms)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_secs.map(Duration::from_secs)
    }

    pub fn directory_in(&self, config_dir: &Path) -> PathBuf {
        if self.directory.is_absolute() {
            self.directory.clone()
        } else {
            config_dir.join(&self.directory)
        }
    }
}

/// Typed contents of `aghast.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub broker: BrokerSettings,
    pub bus: BusSettings,
    pub automation: AutomationSettings,
    /// Integrations to load, by name
    pub integrations: Vec<String>,
}

impl HubConfig {
    /// Load `aghast.yaml` from `config_dir`; a missing file yields defaults
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        if !config_dir.join(HUB_CONFIG_FILE).is_file() {
            info!(dir = %config_dir.display(), "No {HUB_CONFIG_FILE}, using defaults");
            return Ok(Self::default());
        }

        let yaml = load_yaml(config_dir, HUB_CONFIG_FILE)?;
        Self::from_yaml(yaml)
    }

    pub fn from_yaml(yaml: Value) -> ConfigResult<Self> {
        match yaml {
            Value::Null => Ok(Self::default()),
            Value::Mapping(_) => {
                serde_yaml::from_value(yaml).map_err(|e| ConfigError::InvalidValue {
                    key: HUB_CONFIG_FILE.to_string(),
                    reason: e.to_string(),
                })
            }
            _ => Err(ConfigError::InvalidValue {
                key: HUB_CONFIG_FILE.to_string(),
                reason: "configuration must be a mapping".to_string(),
            }),
        }
    }
}
