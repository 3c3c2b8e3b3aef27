use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::messages::Message;

use crate::error::QueueError;

/// Callback for consumed messages. An error is logged by the consumer loop
/// and the message is still committed.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

/// At-least-once topic log shared between processes.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn publish(&self, topic: &str, message: &Message) -> Result<(), QueueError>;

    /// Feed every message on `topic` not yet committed by `group_id` to
    /// `handler`, until `cancel` fires.
    async fn consume(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError>;
}

#[derive(Default)]
struct TopicLog {
    /// Offset of `entries[0]`.
    base: usize,
    entries: VecDeque<Message>,
    /// Next offset each subscribed group will read.
    committed: HashMap<String, usize>,
}

impl TopicLog {
    /// A group seen for the first time starts at the oldest retained entry.
    fn subscribe(&mut self, group_id: &str) {
        let base = self.base;
        let _ = self.committed.entry(group_id.to_owned()).or_insert(base);
    }

    /// Drop entries every subscribed group has committed past.
    fn compact(&mut self) {
        let Some(low) = self.committed.values().min().copied() else {
            return;
        };
        let done = low.saturating_sub(self.base).min(self.entries.len());
        if done > 0 {
            drop(self.entries.drain(..done));
            self.base += done;
        }
    }
}

/// In-process [`DurableQueue`]. Durable only for the life of the process;
/// expects one consumer per (topic, group).
///
/// An entry is retained until every group that has subscribed to its topic
/// has committed past it. A topic nobody consumes keeps everything.
#[derive(Default)]
pub struct MemoryQueue {
    topics: Mutex<HashMap<String, TopicLog>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages still retained on `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Message> {
        self.topics
            .lock()
            .get(topic)
            .map(|t| t.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Next offset `group_id` will read on `topic`.
    pub fn committed(&self, topic: &str, group_id: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .and_then(|t| t.committed.get(group_id).copied())
            .unwrap_or(0)
    }

    fn subscribe(&self, topic: &str, group_id: &str) {
        self.topics
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .subscribe(group_id);
    }

    fn pending(&self, topic: &str, group_id: &str) -> Vec<(usize, Message)> {
        let topics = self.topics.lock();
        let Some(log) = topics.get(topic) else {
            return Vec::new();
        };
        let from = log
            .committed
            .get(group_id)
            .copied()
            .unwrap_or(log.base)
            .max(log.base);
        log.entries
            .iter()
            .enumerate()
            .skip(from - log.base)
            .map(|(i, m)| (log.base + i, m.clone()))
            .collect()
    }

    fn commit(&self, topic: &str, group_id: &str, next: usize) {
        let mut topics = self.topics.lock();
        let log = topics.entry(topic.to_owned()).or_default();
        let slot = log.committed.entry(group_id.to_owned()).or_insert(0);
        *slot = (*slot).max(next);
        log.compact();
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn publish(&self, topic: &str, message: &Message) -> Result<(), QueueError> {
        self.topics
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .entries
            .push_back(message.clone());
        self.notify.notify_waiters();
        debug!(topic, message_id = %message.id, "published");
        Ok(())
    }

    async fn consume(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        self.subscribe(topic, group_id);
        info!(topic, group_id, "consumer started");
        'outer: loop {
            // Register interest before looking, so a publish in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let pending = self.pending(topic, group_id);
            if pending.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = notified => continue,
                }
            }

            for (offset, message) in pending {
                if cancel.is_cancelled() {
                    break 'outer;
                }
                let message_id = message.id.clone();
                if let Err(error) = handler.handle(message).await {
                    warn!(topic, group_id, message_id = %message_id, error = %error, "handler failed, continuing");
                }
                self.commit(topic, group_id, offset + 1);
            }
        }
        info!(topic, group_id, "consumer stopped");
        Ok(())
    }
}
