//! Virtual devices
//!
//! Devices that exist only in memory, declared in `virtual.yaml`. They behave
//! like real hardware as far as the rest of the hub can tell: controls change
//! their state and are echoed as sensor events, and queries are answered from
//! that state. Useful for trying out rules and as a template for real drivers.
//!
//! ```yaml
//! devices:
//!   Lounge:
//!     primary: Temperature
//!     state:
//!       Temperature: 21.5
//!   Heater:
//!     primary: Power
//!     available: true
//! ```
//!
//! Queries arrive either as bus events carrying a reply channel, or as broker
//! requests on `Virtual/Query/<device>/<query>` answered on the request's
//! `reply_to` topic.

use aghast_bridge::{Bridge, LocalQueue, RequestEnvelope};
use aghast_core::{device_types, queries, Event, EventName, EventValue, Message, Primitive};
use aghast_event_bus::{EventBus, SubscriberId, SubscriberRegistry};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{Integration, IntegrationContext, IntegrationError, IntegrationResult};

/// Name used in the hub's `integrations` list
pub const VIRTUAL_CONFIG_NAME: &str = "virtual";

/// First segment of virtual device event names
pub const VIRTUAL_INTEGRATION: &str = "Virtual";

const CONFIG_FILE: &str = "virtual.yaml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VirtualConfig {
    pub devices: HashMap<String, DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Control whose value `FetchLast` and `IsOn` report
    pub primary: Option<String>,
    pub available: bool,
    /// Initial control values
    pub state: HashMap<String, Primitive>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            primary: None,
            available: true,
            state: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct DeviceState {
    primary: Option<String>,
    available: bool,
    values: HashMap<String, Primitive>,
}

impl DeviceState {
    fn primary_value(&self) -> Primitive {
        self.primary
            .as_ref()
            .and_then(|control| self.values.get(control))
            .cloned()
            .unwrap_or_default()
    }

    fn answer(&self, query: &str) -> Option<Primitive> {
        match query {
            queries::FETCH_LAST | queries::FETCH_LAST_INDEXED => Some(self.primary_value()),
            queries::IS_ON => Some(Primitive::Bool(is_on(&self.primary_value()))),
            queries::IS_AVAILABLE => Some(Primitive::Bool(self.available)),
            _ => None,
        }
    }
}

fn is_on(value: &Primitive) -> bool {
    match value {
        Primitive::Bool(b) => *b,
        Primitive::Number(n) => *n != 0.0,
        Primitive::Text(s) => matches!(s.to_ascii_lowercase().as_str(), "on" | "true"),
        Primitive::Null => false,
    }
}

type Devices = Arc<Mutex<HashMap<String, DeviceState>>>;

fn lock(devices: &Devices) -> MutexGuard<'_, HashMap<String, DeviceState>> {
    devices.lock().unwrap_or_else(|p| p.into_inner())
}

struct Running {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct VirtualIntegration {
    devices: Devices,
    running: Option<Running>,
}

impl VirtualIntegration {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(Mutex::new(HashMap::new())),
            running: None,
        }
    }

    /// Replace the device table
    pub fn configure(&mut self, config: VirtualConfig) {
        let devices: HashMap<String, DeviceState> = config
            .devices
            .into_iter()
            .map(|(name, device)| {
                (
                    name,
                    DeviceState {
                        primary: device.primary,
                        available: device.available,
                        values: device.state,
                    },
                )
            })
            .collect();
        info!(devices = devices.len(), "Configured virtual devices");
        *lock(&self.devices) = devices;
    }

    /// Current value of `control` on `device`
    pub fn value(&self, device: &str, control: &str) -> Option<Primitive> {
        lock(&self.devices)
            .get(device)
            .and_then(|d| d.values.get(control))
            .cloned()
    }
}

impl Default for VirtualIntegration {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Integration for VirtualIntegration {
    fn name(&self) -> &str {
        VIRTUAL_INTEGRATION
    }

    fn load_config(&mut self, config_dir: &Path) -> IntegrationResult<()> {
        if !config_dir.join(CONFIG_FILE).is_file() {
            debug!(dir = %config_dir.display(), "No {CONFIG_FILE}, starting without devices");
            return Ok(());
        }
        let yaml = aghast_config::load_yaml(config_dir, CONFIG_FILE)?;
        let config: VirtualConfig = match yaml {
            serde_yaml::Value::Null => VirtualConfig::default(),
            yaml => serde_yaml::from_value(yaml)
                .map_err(|e| IntegrationError::InvalidConfig(format!("{CONFIG_FILE}: {e}")))?,
        };
        self.configure(config);
        Ok(())
    }

    fn start(&mut self, ctx: IntegrationContext) -> IntegrationResult<()> {
        if self.running.is_some() {
            return Err(IntegrationError::AlreadyStarted(VIRTUAL_INTEGRATION.to_string()));
        }

        let subscriber = ctx.registry.allocate(format!("integration/{VIRTUAL_INTEGRATION}"))?;
        let subscribe = |device_type: &str| {
            ctx.bus
                .subscribe(subscriber, &format!("{VIRTUAL_INTEGRATION}/{device_type}/+/+"))
        };
        let (controls, bus_queries) = match (subscribe(device_types::CONTROL), subscribe(device_types::QUERY)) {
            (Ok(controls), Ok(bus_queries)) => (controls, bus_queries),
            (Err(e), _) | (_, Err(e)) => {
                ctx.bus.unsubscribe_all(subscriber);
                ctx.registry.release(subscriber);
                return Err(e.into());
            }
        };

        let (stop, stop_rx) = oneshot::channel();
        let worker = Worker {
            devices: self.devices.clone(),
            bus: ctx.bus,
            bridge: ctx.bridge,
            registry: ctx.registry,
            subscriber,
        };
        let handle = tokio::spawn(worker.run(controls, bus_queries, stop_rx));
        self.running = Some(Running { stop, handle });
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop.send(());
            if let Err(e) = running.handle.await {
                warn!(error = %e, "Virtual integration task panicked");
            }
        }
    }

    fn provides_device_types(&self) -> Vec<String> {
        vec![
            device_types::CONTROL.to_string(),
            device_types::QUERY.to_string(),
            device_types::SENSOR.to_string(),
        ]
    }
}

struct Worker {
    devices: Devices,
    bus: EventBus,
    bridge: Bridge,
    registry: Arc<SubscriberRegistry>,
    subscriber: SubscriberId,
}

impl Worker {
    fn broker_query_topic() -> String {
        format!("{VIRTUAL_INTEGRATION}/{}/+/+", device_types::QUERY)
    }

    async fn run(
        self,
        mut controls: mpsc::Receiver<Event>,
        mut bus_queries: mpsc::Receiver<Event>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let topic = Self::broker_query_topic();
        let mut broker_queries = match self.bridge.subscribe_to_topic(&topic).await {
            Ok(queue) => Some(queue),
            Err(e) => {
                warn!(topic = %topic, error = %e, "Broker queries unavailable");
                None
            }
        };

        info!("Virtual integration running");
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                Some(event) = controls.recv() => self.handle_control(event).await,
                Some(event) = bus_queries.recv() => self.handle_bus_query(event),
                Some(message) = next_message(&mut broker_queries) => self.handle_broker_query(message).await,
                else => break,
            }
        }

        if let Some(queue) = broker_queries {
            if let Err(e) = self.bridge.unsubscribe_from_topic(&topic, &queue.handle()).await {
                warn!(topic = %topic, error = %e, "Failed to unsubscribe broker queries");
            }
        }
        self.bus.unsubscribe_all(self.subscriber);
        self.registry.release(self.subscriber);
        info!("Virtual integration stopped");
    }

    async fn handle_control(&self, event: Event) {
        let (Some(device), Some(control)) = (event.name.segment(2), event.name.segment(3)) else {
            return;
        };
        let Some(value) = event.value.as_primitive().cloned() else {
            warn!(event = %event.name, "Control event without a value");
            return;
        };

        {
            let mut devices = lock(&self.devices);
            let Some(state) = devices.get_mut(device) else {
                warn!(device, "Control for unknown virtual device");
                return;
            };
            state.values.insert(control.to_string(), value.clone());
        }
        debug!(device, control, value = %value, "Virtual control applied");

        let sensor = EventName::from_segments([VIRTUAL_INTEGRATION, device_types::SENSOR, device, control]);
        match sensor {
            Ok(name) => {
                if let Err(e) = self.bus.publish(Event::new(name, value)).await {
                    warn!(device, control, error = %e, "Failed to publish sensor event");
                }
            }
            Err(e) => warn!(device, control, error = %e, "Invalid sensor event name"),
        }
    }

    fn answer(&self, device: &str, query: &str) -> Option<Primitive> {
        let devices = lock(&self.devices);
        let Some(state) = devices.get(device) else {
            warn!(device, "Query for unknown virtual device");
            return None;
        };
        let answer = state.answer(query);
        if answer.is_none() {
            warn!(device, query, "Unsupported virtual device query");
        }
        answer
    }

    fn handle_bus_query(&self, event: Event) {
        let EventValue::Reply(reply) = &event.value else {
            trace!(event = %event.name, "Query event without reply channel");
            return;
        };
        let (Some(device), Some(query)) = (event.name.segment(2), event.name.segment(3)) else {
            return;
        };
        if let Some(answer) = self.answer(device, query) {
            if let Err(e) = reply.reply(answer) {
                debug!(event = %event.name, error = %e, "Query reply not delivered");
            }
        }
    }

    async fn handle_broker_query(&self, message: Message) {
        let envelope: RequestEnvelope = match message.payload_json() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Broker query without reply_to");
                return;
            }
        };
        let mut segments = message.topic.split('/').skip(2);
        let (Some(device), Some(query)) = (segments.next(), segments.next()) else {
            return;
        };
        let Some(answer) = self.answer(device, query) else {
            return;
        };
        if let Err(e) = self.bridge.publish(Message::primitive(envelope.reply_to, &answer)).await {
            warn!(topic = %message.topic, error = %e, "Failed to publish query reply");
        }
    }
}

async fn next_message(queue: &mut Option<LocalQueue>) -> Option<Message> {
    match queue {
        Some(queue) => queue.recv().await,
        None => std::future::pending().await,
    }
}
