//! Configuration loading for the aghast hub
//!
//! YAML files may use a few custom tags:
//!
//! - `!include path` - Include another YAML file
//! - `!secret key` - Substitute from secrets.yaml
//! - `!env_var VAR` - Environment variable substitution
//!
//! [`HubConfig`] is the typed view of `aghast.yaml`.
//!
//! # Example
//!
//! ```ignore
//! use aghast_config::{HubConfig, YamlLoader};
//!
//! let config = HubConfig::load("/etc/aghast")?;
//!
//! // Integrations load their own files through the same loader
//! let mut loader = YamlLoader::new("/etc/aghast")?;
//! let devices = loader.load_file("virtual.yaml")?;
//! ```

mod error;
mod hub;
mod loader;
mod secrets;

pub use error::{ConfigError, ConfigResult};
pub use hub::{AutomationSettings, BrokerSettings, BusSettings, HubConfig, HUB_CONFIG_FILE};
pub use loader::{load_yaml, load_yaml_string, YamlLoader};
pub use secrets::Secrets;

pub use serde_yaml::Value;
