//! Integration lifecycle

use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::virtual_devices::{VirtualIntegration, VIRTUAL_CONFIG_NAME};
use crate::{Integration, IntegrationContext, IntegrationError, IntegrationResult};

/// Builds a fresh, unconfigured integration
pub type IntegrationFactory = Arc<dyn Fn() -> Box<dyn Integration> + Send + Sync + 'static>;

/// Creates, starts and stops the configured integrations
pub struct IntegrationManager {
    factories: DashMap<String, IntegrationFactory>,
    loaded: Mutex<Vec<Box<dyn Integration>>>,
}

impl IntegrationManager {
    /// Manager with no factories registered
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// Manager with the integrations shipped in this crate
    pub fn with_builtins() -> Self {
        let manager = Self::new();
        manager.register(
            VIRTUAL_CONFIG_NAME,
            Arc::new(|| Box::new(VirtualIntegration::new()) as Box<dyn Integration>),
        );
        manager
    }

    /// Register a factory under the name used in the hub configuration
    pub fn register(&self, name: &str, factory: IntegrationFactory) {
        self.factories.insert(name.to_string(), factory);
        debug!(integration = name, "Registered integration factory");
    }

    /// Create and configure the named integrations
    ///
    /// Unknown names and configuration failures are logged and skipped.
    /// Returns how many were loaded.
    pub async fn load(&self, names: &[String], config_dir: &Path) -> usize {
        let mut loaded = self.loaded.lock().await;
        let before = loaded.len();

        for name in names {
            match self.create(name, config_dir) {
                Ok(integration) => {
                    info!(integration = %name, "Loaded integration");
                    loaded.push(integration);
                }
                Err(e) => warn!(integration = %name, error = %e, "Skipping integration"),
            }
        }
        loaded.len() - before
    }

    fn create(&self, name: &str, config_dir: &Path) -> IntegrationResult<Box<dyn Integration>> {
        let factory = self
            .factories
            .get(name)
            .map(|f| f.value().clone())
            .ok_or_else(|| IntegrationError::Unknown(name.to_string()))?;
        let mut integration = factory();
        integration.load_config(config_dir)?;
        Ok(integration)
    }

    /// Start every loaded integration, returning how many started
    ///
    /// Other failures are logged and the integration is left stopped; running
    /// out of subscriber identities aborts with [`IntegrationError::Registry`].
    pub async fn start_all(&self, ctx: &IntegrationContext) -> IntegrationResult<usize> {
        let mut loaded = self.loaded.lock().await;
        let mut started = 0;
        for integration in loaded.iter_mut() {
            match integration.start(ctx.clone()) {
                Ok(()) => {
                    info!(
                        integration = integration.name(),
                        device_types = ?integration.provides_device_types(),
                        "Started integration"
                    );
                    started += 1;
                }
                Err(e @ IntegrationError::Registry(_)) => {
                    error!(integration = integration.name(), error = %e, "Integration failed to start");
                    return Err(e);
                }
                Err(e) => error!(integration = integration.name(), error = %e, "Integration failed to start"),
            }
        }
        Ok(started)
    }

    /// Stop every loaded integration
    pub async fn stop_all(&self) {
        let mut loaded = self.loaded.lock().await;
        for integration in loaded.iter_mut() {
            integration.stop().await;
            debug!(integration = integration.name(), "Stopped integration");
        }
    }

    /// Names of the loaded integrations
    pub async fn names(&self) -> Vec<String> {
        self.loaded
            .lock()
            .await
            .iter()
            .map(|i| i.name().to_string())
            .collect()
    }
}

impl Default for IntegrationManager {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Counting {
        stops: Arc<AtomicUsize>,
        fail_config: bool,
    }

    #[async_trait]
    impl Integration for Counting {
        fn name(&self) -> &str {
            "Counting"
        }

        fn load_config(&mut self, _config_dir: &Path) -> IntegrationResult<()> {
            if self.fail_config {
                return Err(IntegrationError::InvalidConfig("broken".into()));
            }
            Ok(())
        }

        fn start(&mut self, _ctx: IntegrationContext) -> IntegrationResult<()> {
            Ok(())
        }

        async fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn provides_device_types(&self) -> Vec<String> {
            vec!["Sensor".to_string()]
        }
    }

    #[tokio::test]
    async fn test_load_skips_unknown_and_broken() {
        let dir = TempDir::new().unwrap();
        let stops = Arc::new(AtomicUsize::new(0));
        let manager = IntegrationManager::new();

        let ok_stops = stops.clone();
        manager.register(
            "counting",
            Arc::new(move || {
                Box::new(Counting {
                    stops: ok_stops.clone(),
                    fail_config: false,
                }) as Box<dyn Integration>
            }),
        );
        let broken_stops = stops.clone();
        manager.register(
            "broken",
            Arc::new(move || {
                Box::new(Counting {
                    stops: broken_stops.clone(),
                    fail_config: true,
                }) as Box<dyn Integration>
            }),
        );

        let names = vec![
            "counting".to_string(),
            "missing".to_string(),
            "broken".to_string(),
        ];
        assert_eq!(manager.load(&names, dir.path()).await, 1);
        assert_eq!(manager.names().await, vec!["Counting".to_string()]);

        manager.stop_all().await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_all_fails_when_identities_run_out() {
        use aghast_bridge::{Bridge, BridgeConfig, MemoryBroker};
        use aghast_event_bus::{BusConfig, EventBus, RegistryError, SubscriberRegistry};

        let dir = TempDir::new().unwrap();
        let manager = IntegrationManager::with_builtins();
        assert_eq!(manager.load(&[VIRTUAL_CONFIG_NAME.to_string()], dir.path()).await, 1);

        let registry = Arc::new(SubscriberRegistry::new(0));
        let (bus, _dispatcher) = EventBus::start(registry.clone(), BusConfig::default());
        let (bridge, _) = Bridge::start(Arc::new(MemoryBroker::new().connect()), BridgeConfig::default());
        let ctx = IntegrationContext {
            bus,
            bridge,
            registry,
        };

        let err = manager.start_all(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            IntegrationError::Registry(RegistryError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_builtins_registered() {
        let manager = IntegrationManager::with_builtins();
        assert!(manager.factories.contains_key(VIRTUAL_CONFIG_NAME));
    }
}
