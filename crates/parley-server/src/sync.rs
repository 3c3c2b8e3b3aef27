//! Offline catch-up: cached window first, durable store for the rest.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use parley_core::ids::{MessageId, UserId};
use parley_core::messages::Message;
use parley_settings::DeliverySettings;
use parley_store::{FastCache, MessageStore};

use crate::errors::ChatError;

/// One page of offline messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

pub struct OfflineSync {
    cache: Arc<dyn FastCache>,
    store: Arc<dyn MessageStore>,
    default_limit: usize,
    max_limit: usize,
    window: usize,
}

impl OfflineSync {
    pub fn new(cache: Arc<dyn FastCache>, store: Arc<dyn MessageStore>, settings: &DeliverySettings) -> Self {
        Self {
            cache,
            store,
            default_limit: settings.sync_default_limit,
            max_limit: settings.sync_max_limit,
            window: settings.offline_list_max,
        }
    }

    /// Effective page size for a requested `limit`. Zero picks the default.
    pub fn clamp_limit(&self, limit: usize) -> usize {
        let limit = if limit == 0 { self.default_limit } else { limit };
        limit.min(self.max_limit)
    }

    /// Messages for `user` newer than `last`: cached backlog first, then the
    /// store in `(timestamp, id)` order, free of duplicates.
    /// `has_more` is set when the page came back full.
    #[instrument(skip(self), fields(user = %user))]
    pub async fn sync_offline(
        &self,
        user: &UserId,
        last: Option<&MessageId>,
        limit: usize,
    ) -> Result<SyncPage, ChatError> {
        let limit = self.clamp_limit(limit);

        let cached = match self.cache.offline_range(user, 0, self.window).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "offline cache read failed, using store only");
                Vec::new()
            }
        };

        let mut seen: HashSet<MessageId> = HashSet::new();
        let mut messages: Vec<Message> = cached
            .into_iter()
            .filter(|m| last.map_or(true, |cursor| &m.id > cursor))
            .filter(|m| seen.insert(m.id.clone()))
            .take(limit)
            .collect();
        let from_cache = messages.len();

        if messages.len() < limit {
            // Cached entries may also be in the store; over-fetch by that many.
            let want = limit - messages.len() + seen.len();
            let stored = self.store.list_undelivered(user, last, want).await?;
            for message in stored {
                if messages.len() >= limit {
                    break;
                }
                if seen.insert(message.id.clone()) {
                    messages.push(message);
                }
            }
        }

        let has_more = messages.len() == limit;
        debug!(from_cache, total = messages.len(), has_more, "offline page assembled");
        Ok(SyncPage { messages, has_more })
    }
}
