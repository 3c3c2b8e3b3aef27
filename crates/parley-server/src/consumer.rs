//! Durable-queue consumers that reach users who were not locally reachable
//! when a message was sent.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use parley_core::envelope::Envelope;
use parley_core::messages::{Message, MessageStatus};
use parley_store::{DurableQueue, MessageHandler, MessageStore};

use crate::delivery::{push_to_user, PushOutcome};
use crate::membership::MembershipService;
use crate::registry::Registry;

/// Private-topic handler: push to the receiver if they are now online here.
pub struct PrivateRedelivery {
    registry: Arc<Registry>,
    store: Arc<dyn MessageStore>,
}

impl PrivateRedelivery {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn MessageStore>) -> Self {
        Self { registry, store }
    }
}

#[async_trait]
impl MessageHandler for PrivateRedelivery {
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        let Some(receiver) = message.receiver_id() else {
            anyhow::bail!("message {} on private topic has no receiver", message.id);
        };
        let frame = Arc::new(Envelope::push(&message)?.encode()?);
        match push_to_user(&self.registry, receiver, &frame) {
            PushOutcome::Pushed => {
                let _ = self
                    .store
                    .update_status(&message.id, MessageStatus::Delivered)
                    .await?;
                debug!(message_id = %message.id, "redelivered from offline topic");
            }
            outcome => debug!(message_id = %message.id, ?outcome, "receiver still unreachable"),
        }
        Ok(())
    }
}

/// Group-topic handler: push to every member with an OPEN local session.
/// Members may see a message twice; clients dedupe by id.
pub struct GroupFanout {
    registry: Arc<Registry>,
    membership: Arc<MembershipService>,
}

impl GroupFanout {
    pub fn new(registry: Arc<Registry>, membership: Arc<MembershipService>) -> Self {
        Self { registry, membership }
    }
}

#[async_trait]
impl MessageHandler for GroupFanout {
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        let Some(group) = message.group_id() else {
            anyhow::bail!("message {} on group topic has no group", message.id);
        };
        let members = self.membership.members(group).await?;
        let frame = Arc::new(Envelope::push(&message)?.encode()?);
        let pushed = members
            .iter()
            .filter(|m| **m != message.sender_id)
            .filter(|m| push_to_user(&self.registry, m, &frame) == PushOutcome::Pushed)
            .count();
        debug!(message_id = %message.id, pushed, "group topic fan-out");
        Ok(())
    }
}

/// Start one consume loop per `(topic, handler)` pair under `group_id`.
/// Every loop stops when `cancel` fires.
pub fn spawn_consumers(
    queue: Arc<dyn DurableQueue>,
    group_id: &str,
    handlers: Vec<(String, Arc<dyn MessageHandler>)>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    handlers
        .into_iter()
        .map(|(topic, handler)| {
            let queue = Arc::clone(&queue);
            let group_id = group_id.to_string();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = queue.consume(&topic, &group_id, handler, cancel).await {
                    error!(topic = %topic, group_id = %group_id, error = %e, "consumer stopped with error");
                }
            })
        })
        .collect()
}
