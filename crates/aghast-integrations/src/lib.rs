//! Integrations for the aghast hub
//!
//! An integration is a device driver. It owns the devices of one family and
//! talks to the rest of the hub only through the event bus and the broker
//! bridge: it handles `Control` events addressed to its devices, answers
//! `Query` events, and publishes `Sensor` events as device state changes.
//!
//! [`IntegrationManager`] instantiates the integrations named in the hub
//! configuration from registered factories.

mod manager;
pub mod virtual_devices;

use aghast_bridge::{Bridge, BridgeError};
use aghast_config::ConfigError;
use aghast_event_bus::{BusError, EventBus, RegistryError, SubscriberRegistry};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub use manager::{IntegrationFactory, IntegrationManager};

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("Unknown integration: {0}")]
    Unknown(String),

    #[error("Integration {0} is already running")]
    AlreadyStarted(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Subscriber registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type IntegrationResult<T> = Result<T, IntegrationError>;

/// Handles an integration is started with
#[derive(Clone)]
pub struct IntegrationContext {
    pub bus: EventBus,
    pub bridge: Bridge,
    pub registry: Arc<SubscriberRegistry>,
}

/// A pluggable device driver
#[async_trait]
pub trait Integration: Send {
    /// First segment of the event names this integration owns
    fn name(&self) -> &str;

    /// Read the integration's own configuration from `config_dir`
    fn load_config(&mut self, config_dir: &Path) -> IntegrationResult<()>;

    /// Subscribe and spawn the integration's tasks; must not block
    fn start(&mut self, ctx: IntegrationContext) -> IntegrationResult<()>;

    /// Stop every task spawned by `start` and wait for them to exit
    async fn stop(&mut self);

    /// Device types the integration handles, e.g. `Control`, `Query`
    fn provides_device_types(&self) -> Vec<String>;
}
