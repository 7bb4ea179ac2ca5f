//! Remote control of rules over the broker
//!
//! Requests arrive on `<prefix>client/list` and `<prefix>client/changeEnabled`
//! (payload: rule name). Both are answered by publishing the current rule list
//! as a JSON array of [`RuleSummary`](crate::RuleSummary) on
//! `<prefix>server/list`.

use aghast_bridge::{Bridge, LocalQueue};
use aghast_core::Message;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::RuleEngine;
use crate::{AutomationError, AutomationResult};

pub const LIST_REQUEST: &str = "client/list";
pub const CHANGE_ENABLED_REQUEST: &str = "client/changeEnabled";
pub const LIST_REPLY: &str = "server/list";

/// Subscribe the control topics and spawn the task serving them
///
/// Both topics feed one queue, so requests are handled in arrival order.
pub async fn start_control(
    engine: Arc<RuleEngine>,
    bridge: Bridge,
    prefix: &str,
) -> AutomationResult<JoinHandle<()>> {
    let list_topic = format!("{}{}", prefix, LIST_REQUEST);
    let change_topic = format!("{}{}", prefix, CHANGE_ENABLED_REQUEST);
    let reply_topic = format!("{}{}", prefix, LIST_REPLY);

    let mut queue = LocalQueue::default();
    bridge
        .subscribe_to_topic_using_chan(&list_topic, &queue.handle())
        .await?;
    bridge
        .subscribe_to_topic_using_chan(&change_topic, &queue.handle())
        .await?;
    info!(prefix, "Automation control surface listening");

    Ok(tokio::spawn(async move {
        while let Some(request) = queue.recv().await {
            if request.topic == change_topic {
                let Some(name) = request.payload_str().map(str::trim) else {
                    warn!(topic = %request.topic, "changeEnabled payload is not text");
                    continue;
                };
                match engine.change_enabled(name).await {
                    Ok(enabled) => info!(rule = %name, enabled, "Rule toggled remotely"),
                    Err(AutomationError::NotFound(_)) => {
                        warn!(rule = %name, "changeEnabled for unknown rule, ignoring");
                        continue;
                    }
                    Err(e) => {
                        error!(rule = %name, error = %e, "changeEnabled failed");
                        continue;
                    }
                }
            } else if request.topic != list_topic {
                debug!(topic = %request.topic, "Ignoring unexpected control message");
                continue;
            }

            publish_list(&engine, &bridge, &reply_topic).await;
        }
    }))
}

async fn publish_list(engine: &RuleEngine, bridge: &Bridge, topic: &str) {
    let message = match Message::json(topic, &engine.summaries()) {
        Ok(message) => message,
        Err(e) => {
            error!(error = %e, "Failed to encode rule list");
            return;
        }
    };
    if let Err(e) = bridge.publish(message).await {
        warn!(topic, error = %e, "Failed to publish rule list");
    }
}
