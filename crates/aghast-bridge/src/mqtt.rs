//! MQTT transport backed by rumqttc
//!
//! One `MqttTransport` is one client connection. Its event loop task routes
//! incoming publishes to the per-filter senders handed out by `subscribe`.
//! Routing never waits: a publish for a subscription whose queue is full is
//! dropped for that subscription, so one stalled topic cannot hold up the
//! event loop or its keep-alives.
//! Reconnection is left to rumqttc: after a connection error the loop waits
//! and polls again, and subscriptions are re-issued on the next ConnAck.

use aghast_core::{Message, QoS};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::filter::topic_matches;
use crate::transport::{BrokerTransport, ConnectionEvent};
use crate::{BridgeError, BridgeResult};

const DEFAULT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 64;
const UPSTREAM_CAPACITY: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection settings for [`MqttTransport::connect`]
#[derive(Debug, Clone)]
pub struct MqttConnectOptions {
    /// `host` or `host:port`
    pub address: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl MqttConnectOptions {
    pub fn new(address: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// Split `address` into host and port
    pub fn host_port(&self) -> BridgeResult<(String, u16)> {
        let address = self
            .address
            .trim_start_matches("mqtt://")
            .trim_start_matches("tcp://");
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| BridgeError::InvalidAddress(self.address.clone()))?;
                Ok((host.to_string(), port))
            }
            None if !address.is_empty() => Ok((address.to_string(), DEFAULT_PORT)),
            _ => Err(BridgeError::InvalidAddress(self.address.clone())),
        }
    }
}

struct Route {
    filter: String,
    qos: QoS,
    tx: mpsc::Sender<Message>,
}

type Routes = Arc<Mutex<Vec<Route>>>;

fn lock(routes: &Routes) -> MutexGuard<'_, Vec<Route>> {
    routes.lock().unwrap_or_else(|p| p.into_inner())
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_mqtt_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// A broker connection over MQTT
pub struct MqttTransport {
    client: AsyncClient,
    routes: Routes,
    events: broadcast::Sender<ConnectionEvent>,
    event_loop: JoinHandle<()>,
}

impl MqttTransport {
    /// Create the client and spawn its event loop
    ///
    /// Returns immediately; the connection is established in the background
    /// and reported through [`BrokerTransport::connection_events`].
    pub fn connect(options: &MqttConnectOptions) -> BridgeResult<Self> {
        let (host, port) = options.host_port()?;
        let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host.clone(), port);
        mqtt_options.set_keep_alive(options.keep_alive);
        if let Some(username) = &options.username {
            mqtt_options.set_credentials(
                username.clone(),
                options.password.clone().unwrap_or_default(),
            );
        }

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let routes: Routes = Arc::new(Mutex::new(Vec::new()));
        let (events, _) = broadcast::channel(16);

        info!(host = %host, port, client_id = %options.client_id, "Connecting to MQTT broker");

        let loop_routes = routes.clone();
        let loop_events = events.clone();
        let loop_client = client.clone();
        let client_id = options.client_id.clone();
        let event_loop = tokio::spawn(async move {
            let mut connected_before = false;
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(client_id = %client_id, "Connected to MQTT broker");
                        if connected_before {
                            resubscribe(&loop_client, &loop_routes);
                        }
                        connected_before = true;
                        let _ = loop_events.send(ConnectionEvent::Connected);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = Message::new(publish.topic, publish.payload)
                            .with_qos(from_mqtt_qos(publish.qos))
                            .with_retained(publish.retain);
                        route(&loop_routes, message);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(client_id = %client_id, error = %e, "MQTT connection lost");
                        let _ = loop_events.send(ConnectionEvent::Lost(e.to_string()));
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            routes,
            events,
            event_loop,
        })
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

fn resubscribe(client: &AsyncClient, routes: &Routes) {
    for route in lock(routes).iter() {
        if let Err(e) = client.try_subscribe(route.filter.clone(), to_mqtt_qos(route.qos)) {
            warn!(topic = %route.filter, error = %e, "Failed to re-subscribe after reconnect");
        }
    }
}

fn route(routes: &Routes, message: Message) {
    let targets: Vec<mpsc::Sender<Message>> = lock(routes)
        .iter()
        .filter(|r| topic_matches(&r.filter, &message.topic))
        .map(|r| r.tx.clone())
        .collect();

    trace!(topic = %message.topic, targets = targets.len(), "Routing MQTT publish");
    for tx in targets {
        match tx.try_send(message.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(topic = %message.topic, "Subscription queue full, dropping publish");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(topic = %message.topic, "Dropped publish for closed subscription");
            }
        }
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn publish(&self, message: Message) -> BridgeResult<()> {
        self.client
            .publish(
                message.topic.clone(),
                to_mqtt_qos(message.qos),
                message.retained,
                message.payload.to_vec(),
            )
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> BridgeResult<mpsc::Receiver<Message>> {
        let (tx, rx) = mpsc::channel(UPSTREAM_CAPACITY);
        lock(&self.routes).push(Route {
            filter: topic.to_string(),
            qos,
            tx,
        });

        if let Err(e) = self.client.subscribe(topic, to_mqtt_qos(qos)).await {
            lock(&self.routes).retain(|r| r.filter != topic);
            return Err(BridgeError::Transport(e.to_string()));
        }
        debug!(topic, "MQTT subscribe");
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> BridgeResult<()> {
        lock(&self.routes).retain(|r| r.filter != topic);
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        debug!(topic, "MQTT unsubscribe");
        Ok(())
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port() {
        let opts = MqttConnectOptions::new("broker.local:1884", "aghast");
        assert_eq!(opts.host_port().unwrap(), ("broker.local".to_string(), 1884));

        let opts = MqttConnectOptions::new("mqtt://broker.local", "aghast");
        assert_eq!(opts.host_port().unwrap(), ("broker.local".to_string(), 1883));

        let opts = MqttConnectOptions::new("broker.local:notaport", "aghast");
        assert!(matches!(opts.host_port(), Err(BridgeError::InvalidAddress(_))));

        let opts = MqttConnectOptions::new("", "aghast");
        assert!(opts.host_port().is_err());
    }

    #[test]
    fn test_route_skips_full_subscription() {
        let (stuck_tx, _stuck_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(4);
        let routes: Routes = Arc::new(Mutex::new(vec![
            Route {
                filter: "slow/#".to_string(),
                qos: QoS::AtMostOnce,
                tx: stuck_tx,
            },
            Route {
                filter: "+/state".to_string(),
                qos: QoS::AtMostOnce,
                tx: fast_tx,
            },
        ]));

        for n in 0..3 {
            route(&routes, Message::new("slow/state", n.to_string()));
        }
        assert_eq!(fast_rx.try_recv().unwrap().payload_str(), Some("0"));
        assert_eq!(fast_rx.try_recv().unwrap().payload_str(), Some("1"));
        assert_eq!(fast_rx.try_recv().unwrap().payload_str(), Some("2"));
    }
}
