//! aghast hub server
//!
//! Main entry point: loads the hub configuration, wires the event bus, the
//! broker bridges, the rule engine and the integrations together, and runs
//! until interrupted.

use aghast_automation::{start_control, AutomationError, EngineConfig, RuleEngine, RuleStore};
use aghast_bridge::{Bridge, BridgeConfig, BrokerTransport, ConnectionEvent, MemoryBroker};
use aghast_config::{BrokerSettings, HubConfig};
use aghast_event_bus::{BusConfig, EventBus, SubscriberRegistry};
use aghast_integrations::{IntegrationContext, IntegrationManager};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aghast", version, about = "Home automation hub")]
struct Args {
    /// Directory holding aghast.yaml, secrets.yaml and the rule files
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    config_dir: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

/// Main and scratch bridges
///
/// The scratch bridge runs on its own broker connection and only carries
/// condition queries. Without a broker address both bridges attach to one
/// in-process broker.
fn connect_bridges(settings: &BrokerSettings, config: &BridgeConfig) -> Result<(Bridge, Bridge)> {
    let (main, scratch): (Arc<dyn BrokerTransport>, Arc<dyn BrokerTransport>) =
        match &settings.address {
            Some(address) => connect_mqtt(settings, address)?,
            None => {
                info!("No broker address configured, using in-process broker");
                let broker = MemoryBroker::new();
                (Arc::new(broker.connect()), Arc::new(broker.connect()))
            }
        };
    let (bridge, _) = Bridge::start(main, config.clone());
    let (scratch, _) = Bridge::start(scratch, config.clone());
    Ok((bridge, scratch))
}

#[cfg(feature = "mqtt")]
fn connect_mqtt(
    settings: &BrokerSettings,
    address: &str,
) -> Result<(Arc<dyn BrokerTransport>, Arc<dyn BrokerTransport>)> {
    use aghast_bridge::{MqttConnectOptions, MqttTransport};

    let options = |client_id: String| {
        MqttConnectOptions::new(address, client_id)
            .with_credentials(settings.username.clone(), settings.password.clone())
    };
    let main = MqttTransport::connect(&options(settings.client_id.clone()))
        .with_context(|| format!("Failed to connect to broker at {address}"))?;
    let scratch = MqttTransport::connect(&options(format!("{}-scratch", settings.client_id)))
        .with_context(|| format!("Failed to connect scratch client to {address}"))?;
    info!(address, client_id = %settings.client_id, "Connecting to MQTT broker");
    Ok((Arc::new(main), Arc::new(scratch)))
}

#[cfg(not(feature = "mqtt"))]
fn connect_mqtt(
    _settings: &BrokerSettings,
    address: &str,
) -> Result<(Arc<dyn BrokerTransport>, Arc<dyn BrokerTransport>)> {
    anyhow::bail!("Broker address {address} configured but built without the mqtt feature")
}

/// The running hub
pub struct Hub {
    pub config: HubConfig,
    pub bus: EventBus,
    pub bridge: Bridge,
    pub engine: Arc<RuleEngine>,
    pub integrations: IntegrationManager,
    control: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Hub {
    /// Bring every component up in dependency order
    pub async fn start(config_dir: PathBuf) -> Result<Self> {
        let config = HubConfig::load(&config_dir)
            .with_context(|| format!("Failed to load configuration from {}", config_dir.display()))?;

        let registry = Arc::new(SubscriberRegistry::new(config.bus.max_subscribers));
        let (bus, dispatcher) = EventBus::start(
            registry.clone(),
            BusConfig {
                queue_capacity: config.bus.queue_capacity,
                inbound_capacity: config.bus.inbound_capacity,
            },
        );

        let (bridge, scratch) = connect_bridges(&config.broker, &BridgeConfig::default())?;

        let store = RuleStore::new(config.automation.directory_in(&config_dir));
        let engine = Arc::new(RuleEngine::new(
            store,
            bus.clone(),
            bridge.clone(),
            scratch,
            EngineConfig {
                action_pacing: config.automation.action_pacing(),
                query_timeout: config.automation.query_timeout(),
            },
        ));
        let loaded = engine.load().await?;
        let started = match engine.start_enabled().await {
            Ok(started) => started,
            Err(e) => {
                engine.stop_all().await;
                bus.shutdown();
                return Err(e).context("Failed to start automation rules");
            }
        };
        info!(loaded, started, "Rule engine ready");

        let control = start_control(engine.clone(), bridge.clone(), &config.automation.admin_prefix)
            .await
            .context("Failed to start automation control surface")?;

        let integrations = IntegrationManager::with_builtins();
        integrations.load(&config.integrations, &config_dir).await;
        let running = match integrations
            .start_all(&IntegrationContext {
                bus: bus.clone(),
                bridge: bridge.clone(),
                registry,
            })
            .await
        {
            Ok(running) => running,
            Err(e) => {
                control.abort();
                engine.stop_all().await;
                integrations.stop_all().await;
                bus.shutdown();
                return Err(e).context("Failed to start integrations");
            }
        };
        info!(integrations = running, "Integrations started");

        Ok(Self {
            config,
            bus,
            bridge,
            engine,
            integrations,
            control,
            dispatcher,
        })
    }

    /// Stop rules and integrations, then the bus
    pub async fn shutdown(self) {
        self.control.abort();
        self.engine.stop_all().await;
        self.integrations.stop_all().await;
        self.bus.shutdown();
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "Bus dispatcher ended abnormally");
        }
        info!("Hub stopped");
    }
}

#[cfg(unix)]
async fn hangup(signal: &mut Option<tokio::signal::unix::Signal>) {
    match signal {
        Some(signal) => {
            signal.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn hangup(_signal: &mut Option<()>) {
    std::future::pending().await
}

async fn next_report<T>(reports: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match reports {
        Some(reports) => reports.recv().await,
        None => std::future::pending().await,
    }
}

async fn run(hub: &Hub) -> Result<()> {
    #[cfg(unix)]
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .map_err(|e| warn!(error = %e, "SIGHUP reload unavailable"))
        .ok();
    #[cfg(not(unix))]
    let mut sighup: Option<()> = None;

    let mut overflow = hub.bus.take_overflow_reports();
    let mut exhausted = hub.engine.take_exhaustion_reports();
    let mut connection = hub.bridge.connection_events();
    let mut connection_open = true;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                info!("Interrupted, shutting down");
                return Ok(());
            }
            _ = hangup(&mut sighup) => {
                info!("SIGHUP received, reloading rules");
                match hub.engine.reload().await {
                    Ok(started) => info!(started, "Rules reloaded"),
                    Err(e @ AutomationError::Registry(_)) => {
                        return Err(e).context("Rule reload ran out of subscriber identities");
                    }
                    Err(e) => error!(error = %e, "Rule reload failed"),
                }
            }
            Some(report) = next_report(&mut exhausted) => {
                error!(error = %report, "Subscriber identities exhausted");
                anyhow::bail!(report);
            }
            Some(report) = next_report(&mut overflow) => {
                error!(
                    subscriber = %report.subscriber,
                    owner = %report.owner,
                    pattern = %report.pattern,
                    event = %report.event,
                    "Event queue overflow"
                );
                if hub.config.bus.fatal_on_overflow {
                    anyhow::bail!("Event queue of {} overflowed", report.owner);
                }
            }
            event = connection.recv(), if connection_open => match event {
                Ok(ConnectionEvent::Connected) => info!("Broker connected"),
                Ok(ConnectionEvent::Lost(reason)) => warn!(%reason, "Broker connection lost"),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "Missed broker connection events");
                }
                Err(broadcast::error::RecvError::Closed) => connection_open = false,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!(config_dir = %args.config_dir.display(), "Starting aghast");
    let hub = Hub::start(args.config_dir).await?;
    info!("aghast is running");

    let outcome = run(&hub).await;
    hub.shutdown().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use aghast_core::Message;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_args() {
        let args = Args::parse_from(["aghast", "--config-dir", "/etc/aghast", "-l", "debug"]);
        assert_eq!(args.config_dir, PathBuf::from("/etc/aghast"));
        assert_eq!(args.log_level, "debug");
    }

    #[tokio::test]
    async fn test_hub_starts_and_stops() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("aghast.yaml"),
            "integrations:\n  - virtual\n  - nonexistent\n",
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("automation")).unwrap();
        std::fs::write(
            dir.path().join("automation/porch.yaml"),
            r#"
name: Porch
trigger:
  event: Virtual/Sensor/Porch/Motion
actions:
  one:
    target: Virtual/Porch
    controls:
      - control: Light
        setting: true
"#,
        )
        .unwrap();

        let hub = Hub::start(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(hub.integrations.names().await, vec!["Virtual".to_string()]);
        assert!(hub.engine.is_running("Porch").await);

        let mut replies = hub
            .bridge
            .subscribe_to_topic("aghast/automation/server/list")
            .await
            .unwrap();
        hub.bridge
            .publish(Message::new("aghast/automation/client/list", ""))
            .await
            .unwrap();
        let list = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(list.payload_str().unwrap().contains("Porch"));

        let registry = hub.bus.registry().clone();
        hub.shutdown().await;
        assert_eq!(registry.in_use(), 0);
    }

    #[tokio::test]
    async fn test_identity_exhaustion_fails_startup() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("aghast.yaml"), "bus:\n  max_subscribers: 1\n").unwrap();
        std::fs::create_dir(dir.path().join("automation")).unwrap();
        for name in ["first", "second"] {
            std::fs::write(
                dir.path().join(format!("automation/{name}.yaml")),
                format!("name: {name}\ntrigger:\n  event: Panel/Sensor/{name}/Press\n"),
            )
            .unwrap();
        }

        let Err(err) = Hub::start(dir.path().to_path_buf()).await else {
            panic!("hub started without enough subscriber identities");
        };
        assert!(err.chain().any(|cause| cause.to_string().contains("exhausted")));
    }
}
