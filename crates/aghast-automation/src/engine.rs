//! Rule execution
//!
//! The `RuleEngine` owns the loaded rules and one task per enabled rule. A
//! rule task waits on its trigger, evaluates the rule's condition through a
//! query round-trip and dispatches the rule's actions in order, pausing
//! between consecutive commands.
//!
//! Only startup, reload and the remote control task start or stop rule tasks;
//! a rule task never touches the running map itself.

use aghast_bridge::{Bridge, BridgeError, LocalQueue};
use aghast_core::{Event, EventName, Message, Primitive};
use aghast_event_bus::{EventBus, RegistryError, SubscriberId, SubscriberRegistry};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::condition::compare;
use crate::rule::{Condition, Dispatch, Rule, Trigger, Via};
use crate::store::RuleStore;
use crate::{AutomationError, AutomationResult};

/// Timing knobs for rule tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Pause between consecutive action dispatches
    pub action_pacing: Duration,
    /// How long a condition waits for its query reply; `None` waits forever
    pub query_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            action_pacing: Duration::from_millis(100),
            query_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Entry of the remote `list` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub name: String,
    pub description: String,
    pub enabled: bool,
}

impl From<&Rule> for RuleSummary {
    fn from(rule: &Rule) -> Self {
        Self {
            name: rule.name.clone(),
            description: rule.description.clone(),
            enabled: rule.enabled,
        }
    }
}

struct RunningRule {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RunningRule {
    async fn shutdown(self, name: &str) {
        // Err means the task already ended on its own
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            error!(rule = %name, error = %e, "Rule task panicked");
        }
    }
}

/// Everything a rule task needs, shared by all of them
struct RuleContext {
    bus: EventBus,
    bridge: Bridge,
    scratch: Bridge,
    registry: Arc<SubscriberRegistry>,
    config: EngineConfig,
}

pub struct RuleEngine {
    store: RuleStore,
    rules: DashMap<String, Rule>,
    running: Mutex<HashMap<String, RunningRule>>,
    ctx: Arc<RuleContext>,
    exhausted_tx: mpsc::UnboundedSender<RegistryError>,
    exhausted_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<RegistryError>>>,
}

impl RuleEngine {
    /// Create an engine; call [`RuleEngine::load`] and
    /// [`RuleEngine::start_enabled`] to run rules
    ///
    /// `scratch` should be a bridge on its own broker connection; condition
    /// queries subscribe and unsubscribe reply topics on it.
    pub fn new(
        store: RuleStore,
        bus: EventBus,
        bridge: Bridge,
        scratch: Bridge,
        config: EngineConfig,
    ) -> Self {
        let registry = bus.registry().clone();
        let (exhausted_tx, exhausted_rx) = mpsc::unbounded_channel();
        Self {
            store,
            rules: DashMap::new(),
            running: Mutex::new(HashMap::new()),
            ctx: Arc::new(RuleContext {
                bus,
                bridge,
                scratch,
                registry,
                config,
            }),
            exhausted_tx,
            exhausted_rx: std::sync::Mutex::new(Some(exhausted_rx)),
        }
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    /// Replace the loaded rules with the store's contents
    ///
    /// Running tasks are not touched.
    pub async fn load(&self) -> AutomationResult<usize> {
        let rules = self.store.load_all().await?;
        self.rules.clear();
        for rule in rules {
            self.rules.insert(rule.name.clone(), rule);
        }
        Ok(self.rules.len())
    }

    /// Add a rule that did not come from the store
    pub fn insert(&self, rule: Rule) {
        self.rules.insert(rule.name.clone(), rule);
    }

    /// Take the stream of identity pool exhaustions hit while enabling rules
    ///
    /// Only the first caller receives the stream.
    pub fn take_exhaustion_reports(&self) -> Option<mpsc::UnboundedReceiver<RegistryError>> {
        self.exhausted_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Start a task for every rule whose enabled flag is set
    ///
    /// A rule whose trigger cannot be subscribed is skipped. Running out of
    /// subscriber identities stops the sweep with [`AutomationError::Registry`].
    pub async fn start_enabled(&self) -> AutomationResult<usize> {
        let mut names: Vec<String> = self
            .rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.key().clone())
            .collect();
        names.sort();

        let mut started = 0;
        for name in names {
            match self.enable(&name).await {
                Ok(()) => started += 1,
                Err(e @ AutomationError::Registry(_)) => return Err(e),
                Err(e) => warn!(rule = %name, error = %e, "Failed to start rule"),
            }
        }
        info!(started, "Automation rules started");
        Ok(started)
    }

    /// Spawn the task for `name` unless it is already running
    ///
    /// The subscriber identity and the trigger subscription are taken before
    /// the task is spawned, so failures surface here. Identity exhaustion is
    /// also sent to [`RuleEngine::take_exhaustion_reports`].
    pub async fn enable(&self, name: &str) -> AutomationResult<()> {
        let rule = self.get(name)?;
        let mut running = self.running.lock().await;
        match running.get(name) {
            Some(entry) if !entry.handle.is_finished() => {
                debug!(rule = %name, "Rule already running");
                return Ok(());
            }
            Some(_) => {
                debug!(rule = %name, "Replacing rule task that ended on its own");
                running.remove(name);
            }
            None => {}
        }

        let subscriber = match self.ctx.registry.allocate(format!("automation/{}", rule.name)) {
            Ok(id) => id,
            Err(e) => {
                error!(rule = %name, error = %e, "Cannot start rule");
                let _ = self.exhausted_tx.send(e.clone());
                return Err(e.into());
            }
        };
        let trigger = match TriggerSource::open(&rule.trigger, subscriber, &self.ctx).await {
            Ok(source) => source,
            Err(e) => {
                error!(rule = %name, trigger = %rule.trigger.pattern(), error = %e, "Trigger subscribe failed");
                self.ctx.bus.unsubscribe_all(subscriber);
                self.ctx.registry.release(subscriber);
                return Err(e);
            }
        };

        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_rule(rule, self.ctx.clone(), subscriber, trigger, stop_rx));
        running.insert(name.to_string(), RunningRule { stop, handle });
        info!(rule = %name, "Rule enabled");
        Ok(())
    }

    /// Stop the task for `name` and wait for it to exit
    pub async fn disable(&self, name: &str) -> AutomationResult<()> {
        if !self.rules.contains_key(name) {
            return Err(AutomationError::NotFound(name.to_string()));
        }

        let entry = self.running.lock().await.remove(name);
        match entry {
            Some(running) => {
                running.shutdown(name).await;
                info!(rule = %name, "Rule disabled");
            }
            None => debug!(rule = %name, "Rule was not running"),
        }
        Ok(())
    }

    /// Stop every rule task
    pub async fn stop_all(&self) {
        let drained: Vec<(String, RunningRule)> = self.running.lock().await.drain().collect();
        let count = drained.len();
        for (name, running) in drained {
            running.shutdown(&name).await;
        }
        info!(count, "Stopped all automation rules");
    }

    /// Stop everything, reread the rule directory and start enabled rules
    pub async fn reload(&self) -> AutomationResult<usize> {
        info!(dir = %self.store.dir().display(), "Reloading automation rules");
        self.stop_all().await;
        self.load().await?;
        self.start_enabled().await
    }

    /// All loaded rules, sorted by name
    pub fn summaries(&self) -> Vec<RuleSummary> {
        let mut summaries: Vec<RuleSummary> =
            self.rules.iter().map(|r| RuleSummary::from(r.value())).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Persist `enabled` for `name`, then start or stop its task
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> AutomationResult<()> {
        let source = self.get(name)?.source;
        RuleStore::persist_enabled(&source, enabled).await?;

        if let Some(mut rule) = self.rules.get_mut(name) {
            rule.enabled = enabled;
        }

        if enabled {
            self.enable(name).await
        } else {
            self.disable(name).await
        }
    }

    /// Flip the enabled flag of `name`, returning the new value
    pub async fn change_enabled(&self, name: &str) -> AutomationResult<bool> {
        let enabled = !self.get(name)?.enabled;
        self.set_enabled(name, enabled).await?;
        Ok(enabled)
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.running
            .lock()
            .await
            .get(name)
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub async fn running_count(&self) -> usize {
        self.running
            .lock()
            .await
            .values()
            .filter(|r| !r.handle.is_finished())
            .count()
    }

    fn get(&self, name: &str) -> AutomationResult<Rule> {
        self.rules
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| AutomationError::NotFound(name.to_string()))
    }
}

/// Where a running rule receives its trigger from
enum TriggerSource {
    Event(mpsc::Receiver<Event>),
    Message { topic: String, queue: LocalQueue },
}

impl TriggerSource {
    async fn open(trigger: &Trigger, subscriber: SubscriberId, ctx: &RuleContext) -> AutomationResult<Self> {
        match trigger {
            Trigger::Event(pattern) => Ok(TriggerSource::Event(
                ctx.bus.subscribe(subscriber, pattern.as_str())?,
            )),
            Trigger::Message(topic) => Ok(TriggerSource::Message {
                topic: topic.clone(),
                queue: ctx.bridge.subscribe_to_topic(topic).await?,
            }),
        }
    }

    /// Wait for the next trigger; `None` once the source is closed
    async fn next(&mut self) -> Option<String> {
        match self {
            TriggerSource::Event(rx) => rx.recv().await.map(|event| event.name.to_string()),
            TriggerSource::Message { queue, .. } => queue.recv().await.map(|message| message.topic),
        }
    }

    async fn close(self, rule: &str, subscriber: SubscriberId, ctx: &RuleContext) {
        match self {
            TriggerSource::Event(_) => {
                ctx.bus.unsubscribe_all(subscriber);
            }
            TriggerSource::Message { topic, queue } => {
                if let Err(e) = ctx.bridge.unsubscribe_from_topic(&topic, &queue.handle()).await {
                    warn!(rule = %rule, topic = %topic, error = %e, "Failed to unsubscribe trigger");
                }
            }
        }
    }
}

async fn run_rule(
    rule: Rule,
    ctx: Arc<RuleContext>,
    subscriber: SubscriberId,
    mut trigger: TriggerSource,
    mut stop: oneshot::Receiver<()>,
) {
    debug!(rule = %rule.name, subscriber = %subscriber, trigger = %rule.trigger.pattern(), "Rule task started");
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            fired = trigger.next() => {
                let Some(source) = fired else {
                    warn!(rule = %rule.name, "Trigger source closed");
                    break;
                };
                trace!(rule = %rule.name, source = %source, "Rule triggered");
                fire(&rule, &ctx).await;
            }
        }
    }

    trigger.close(&rule.name, subscriber, &ctx).await;
    ctx.registry.release(subscriber);
    debug!(rule = %rule.name, "Rule task stopped");
}

async fn fire(rule: &Rule, ctx: &RuleContext) {
    if let Some(condition) = &rule.condition {
        if !evaluate(rule, condition, ctx).await {
            debug!(rule = %rule.name, "Condition not met");
            return;
        }
    }

    for (index, dispatch) in rule.dispatches().iter().enumerate() {
        if index > 0 && !ctx.config.action_pacing.is_zero() {
            tokio::time::sleep(ctx.config.action_pacing).await;
        }
        let result = match dispatch {
            Dispatch::Event { name, setting } => ctx
                .bus
                .publish(Event::new(name.clone(), setting.clone()))
                .await
                .map_err(AutomationError::from),
            Dispatch::Message { topic, setting } => ctx
                .bridge
                .publish(Message::primitive(topic.as_str(), setting))
                .await
                .map_err(AutomationError::from),
        };
        if let Err(e) = result {
            warn!(rule = %rule.name, error = %e, "Action dispatch failed");
        }
    }
    debug!(rule = %rule.name, actions = rule.dispatches().len(), "Rule actions dispatched");
}

async fn evaluate(rule: &Rule, condition: &Condition, ctx: &RuleContext) -> bool {
    let reply = match condition.source {
        Via::Event => query_event(condition, ctx).await,
        Via::Message => query_message(condition, ctx).await,
    };
    match reply {
        Ok(value) => {
            let holds = compare(&value, condition.operator, &condition.expected);
            trace!(
                rule = %rule.name,
                reply = %value,
                operator = %condition.operator,
                expected = %condition.expected,
                holds,
                "Condition evaluated"
            );
            holds
        }
        Err(e) => {
            warn!(rule = %rule.name, query = %condition.query, error = %e, "Condition query failed, treating as false");
            false
        }
    }
}

async fn query_event(condition: &Condition, ctx: &RuleContext) -> AutomationResult<Primitive> {
    let (event, reply) = Event::query(EventName::new(condition.query.as_str())?);
    ctx.bus.publish(event).await?;

    let answer = match ctx.config.query_timeout {
        Some(after) => tokio::time::timeout(after, reply)
            .await
            .map_err(|_| AutomationError::QueryTimeout {
                query: condition.query.clone(),
                after,
            })?,
        None => reply.await,
    };
    let value = answer.map_err(|_| AutomationError::NoReply {
        query: condition.query.clone(),
    })?;

    match (&condition.key, &value) {
        (Some(key), Primitive::Text(text)) => match serde_json::from_str(text) {
            Ok(json) => select_key(condition, key, &json),
            Err(_) => Ok(value),
        },
        _ => Ok(value),
    }
}

async fn query_message(condition: &Condition, ctx: &RuleContext) -> AutomationResult<Primitive> {
    let reply = ctx
        .scratch
        .request(&condition.query, None, ctx.config.query_timeout)
        .await
        .map_err(|e| match e {
            BridgeError::Timeout { after, .. } => AutomationError::QueryTimeout {
                query: condition.query.clone(),
                after,
            },
            other => AutomationError::from(other),
        })?;

    match &condition.key {
        Some(key) => {
            let json: serde_json::Value = reply.payload_json().map_err(BridgeError::from)?;
            select_key(condition, key, &json)
        }
        None => Ok(reply.payload_primitive()),
    }
}

fn select_key(condition: &Condition, key: &str, json: &serde_json::Value) -> AutomationResult<Primitive> {
    json.get(key)
        .and_then(Primitive::from_json)
        .ok_or_else(|| AutomationError::MissingKey {
            query: condition.query.clone(),
            key: key.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Operator;
    use aghast_bridge::{BridgeConfig, MemoryBroker};
    use aghast_event_bus::BusConfig;
    use serde_json::json;

    fn condition(key: Option<&str>) -> Condition {
        Condition {
            source: Via::Message,
            query: "hvac/query".to_string(),
            key: key.map(str::to_string),
            operator: Operator::Eq,
            expected: Primitive::Number(1.0),
        }
    }

    #[test]
    fn test_select_key() {
        let reply = json!({"temperature": 21.5, "mode": "heat", "nested": {"a": 1}});
        let c = condition(Some("temperature"));
        assert_eq!(
            select_key(&c, "temperature", &reply).unwrap(),
            Primitive::Number(21.5)
        );
        assert_eq!(
            select_key(&c, "mode", &reply).unwrap(),
            Primitive::Text("heat".into())
        );
        assert!(matches!(
            select_key(&c, "nested", &reply),
            Err(AutomationError::MissingKey { .. })
        ));
        assert!(select_key(&c, "absent", &reply).is_err());
    }

    #[tokio::test]
    async fn test_unknown_rule() {
        let registry = Arc::new(SubscriberRegistry::new(8));
        let (bus, _dispatcher) = EventBus::start(registry, BusConfig::default());
        let broker = MemoryBroker::new();
        let (bridge, _) = Bridge::start(Arc::new(broker.connect()), BridgeConfig::default());
        let (scratch, _) = Bridge::start(Arc::new(broker.connect()), BridgeConfig::default());
        let engine = RuleEngine::new(
            RuleStore::new("/nonexistent"),
            bus,
            bridge,
            scratch,
            EngineConfig::default(),
        );

        assert!(matches!(
            engine.enable("ghost").await,
            Err(AutomationError::NotFound(_))
        ));
        assert!(matches!(
            engine.change_enabled("ghost").await,
            Err(AutomationError::NotFound(_))
        ));
        assert!(engine.summaries().is_empty());
    }
}
