use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use parley_core::ids::{ConnectionId, GroupId, MessageId, UserId};
use parley_core::messages::Message;
use parley_core::presence::UserPresence;

use crate::error::CacheError;

/// Fast, lossy state: presence, recently sent messages, the per-user offline
/// backlog and group membership sets. Entries may vanish at any time.
#[async_trait]
pub trait FastCache: Send + Sync {
    async fn set_presence(&self, presence: &UserPresence, ttl: Duration) -> Result<(), CacheError>;

    async fn presence(&self, user: &UserId) -> Result<Option<UserPresence>, CacheError>;

    /// Drop presence only if it still belongs to `connection`.
    async fn clear_presence(&self, user: &UserId, connection: &ConnectionId) -> Result<(), CacheError>;

    async fn cache_message(&self, message: &Message, ttl: Duration) -> Result<(), CacheError>;

    async fn cached_message(&self, id: &MessageId) -> Result<Option<Message>, CacheError>;

    /// Append to the user's offline list and refresh its TTL.
    async fn push_offline(&self, user: &UserId, message: &Message, ttl: Duration) -> Result<(), CacheError>;

    /// Oldest-first slice of the offline list.
    async fn offline_range(&self, user: &UserId, start: usize, limit: usize) -> Result<Vec<Message>, CacheError>;

    /// Keep only the newest `max_len` entries.
    async fn trim_offline(&self, user: &UserId, max_len: usize) -> Result<(), CacheError>;

    /// `None` means the set is not cached, not that the group is empty.
    async fn group_members(&self, group: &GroupId) -> Result<Option<HashSet<UserId>>, CacheError>;

    async fn set_group_members(&self, group: &GroupId, members: &[UserId], ttl: Duration) -> Result<(), CacheError>;

    /// Forget a cached set so the next read goes to the store.
    async fn invalidate_group_members(&self, group: &GroupId) -> Result<(), CacheError>;

    /// Drop every expired entry and report how many went. Backends that
    /// expire keys on their own keep the default.
    async fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-process [`FastCache`] on dashmap. Stale entries are dropped when read
/// and by [`purge_expired`](FastCache::purge_expired).
#[derive(Default)]
pub struct MemoryCache {
    presence: DashMap<UserId, Expiring<UserPresence>>,
    messages: DashMap<MessageId, Expiring<Message>>,
    offline: DashMap<UserId, Expiring<VecDeque<Message>>>,
    groups: DashMap<GroupId, Expiring<HashSet<UserId>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offline_len(&self, user: &UserId) -> usize {
        self.offline
            .get(user)
            .filter(|e| e.live())
            .map_or(0, |e| e.value.len())
    }

    /// Live and not yet swept entries across every map.
    pub fn entry_count(&self) -> usize {
        self.presence.len() + self.messages.len() + self.offline.len() + self.groups.len()
    }
}

fn retain_live<K: Eq + Hash, T>(map: &DashMap<K, Expiring<T>>) -> usize {
    let mut removed = 0;
    map.retain(|_, e| {
        let live = e.live();
        if !live {
            removed += 1;
        }
        live
    });
    removed
}

#[async_trait]
impl FastCache for MemoryCache {
    async fn set_presence(&self, presence: &UserPresence, ttl: Duration) -> Result<(), CacheError> {
        self.presence
            .insert(presence.user_id.clone(), Expiring::new(presence.clone(), ttl));
        Ok(())
    }

    async fn presence(&self, user: &UserId) -> Result<Option<UserPresence>, CacheError> {
        self.presence.remove_if(user, |_, e| !e.live());
        Ok(self.presence.get(user).map(|e| e.value.clone()))
    }

    async fn clear_presence(&self, user: &UserId, connection: &ConnectionId) -> Result<(), CacheError> {
        self.presence
            .remove_if(user, |_, e| &e.value.connection_id == connection);
        Ok(())
    }

    async fn cache_message(&self, message: &Message, ttl: Duration) -> Result<(), CacheError> {
        self.messages
            .insert(message.id.clone(), Expiring::new(message.clone(), ttl));
        Ok(())
    }

    async fn cached_message(&self, id: &MessageId) -> Result<Option<Message>, CacheError> {
        self.messages.remove_if(id, |_, e| !e.live());
        Ok(self.messages.get(id).map(|e| e.value.clone()))
    }

    async fn push_offline(&self, user: &UserId, message: &Message, ttl: Duration) -> Result<(), CacheError> {
        let mut entry = self
            .offline
            .entry(user.clone())
            .or_insert_with(|| Expiring::new(VecDeque::new(), ttl));
        if !entry.live() {
            entry.value.clear();
        }
        entry.value.push_back(message.clone());
        entry.expires_at = Instant::now() + ttl;
        Ok(())
    }

    async fn offline_range(&self, user: &UserId, start: usize, limit: usize) -> Result<Vec<Message>, CacheError> {
        self.offline.remove_if(user, |_, e| !e.live());
        Ok(self
            .offline
            .get(user)
            .map(|e| e.value.iter().skip(start).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn trim_offline(&self, user: &UserId, max_len: usize) -> Result<(), CacheError> {
        if let Some(mut entry) = self.offline.get_mut(user) {
            let excess = entry.value.len().saturating_sub(max_len);
            entry.value.drain(..excess);
        }
        Ok(())
    }

    async fn group_members(&self, group: &GroupId) -> Result<Option<HashSet<UserId>>, CacheError> {
        self.groups.remove_if(group, |_, e| !e.live());
        Ok(self.groups.get(group).map(|e| e.value.clone()))
    }

    async fn set_group_members(&self, group: &GroupId, members: &[UserId], ttl: Duration) -> Result<(), CacheError> {
        self.groups.insert(
            group.clone(),
            Expiring::new(members.iter().cloned().collect(), ttl),
        );
        Ok(())
    }

    async fn invalidate_group_members(&self, group: &GroupId) -> Result<(), CacheError> {
        let _ = self.groups.remove(group);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let removed = retain_live(&self.presence)
            + retain_live(&self.messages)
            + retain_live(&self.offline)
            + retain_live(&self.groups);
        if removed > 0 {
            debug!(removed, "expired cache entries purged");
        }
        Ok(removed)
    }
}
