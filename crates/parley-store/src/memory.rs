use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use parley_core::groups::{Group, Membership};
use parley_core::ids::{GroupId, MessageId, UserId};
use parley_core::messages::{Message, MessageStatus};

use crate::error::StoreError;
use crate::traits::{GroupStore, MessageStore};

/// In-process store for single-node runs and tests. Same contract as the
/// SQLite repos.
#[derive(Default)]
pub struct MemoryStore {
    messages: RwLock<HashMap<MessageId, Message>>,
    groups: RwLock<HashMap<GroupId, GroupEntry>>,
}

struct GroupEntry {
    group: Group,
    members: Vec<Membership>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut messages = self.messages.write();
        if messages.contains_key(&message.id) {
            return Err(StoreError::Conflict(format!("message {} already exists", message.id)));
        }
        messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get_message(&self, id: &MessageId) -> Result<Message, StoreError> {
        self.messages
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
    }

    async fn list_undelivered(
        &self,
        user: &UserId,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.read();
        let mut matching: Vec<&Message> = messages
            .values()
            .filter(|m| m.receiver_id() == Some(user))
            .filter(|m| after.map_or(true, |after| &m.id > after))
            .collect();
        matching.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(matching.into_iter().take(limit).cloned().collect())
    }

    async fn update_status(&self, id: &MessageId, status: MessageStatus) -> Result<bool, StoreError> {
        let mut messages = self.messages.write();
        let message = messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
        if !message.status.can_advance_to(status) {
            return Ok(false);
        }
        message.status = status;
        Ok(true)
    }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn create_group(&self, group: &Group, members: &[Membership]) -> Result<(), StoreError> {
        let mut groups = self.groups.write();
        if groups.contains_key(&group.id) {
            return Err(StoreError::Conflict(format!("group {} already exists", group.id)));
        }
        let mut entry = GroupEntry {
            group: group.clone(),
            members: Vec::with_capacity(members.len()),
        };
        for m in members {
            if !entry.members.iter().any(|e| e.user_id == m.user_id) {
                entry.members.push(m.clone());
            }
        }
        groups.insert(group.id.clone(), entry);
        Ok(())
    }

    async fn get_group(&self, id: &GroupId) -> Result<Group, StoreError> {
        self.groups
            .read()
            .get(id)
            .map(|e| e.group.clone())
            .ok_or_else(|| StoreError::NotFound(format!("group {id}")))
    }

    async fn add_member(&self, membership: &Membership) -> Result<bool, StoreError> {
        let mut groups = self.groups.write();
        let entry = groups
            .get_mut(&membership.group_id)
            .ok_or_else(|| StoreError::NotFound(format!("group {}", membership.group_id)))?;
        if entry.members.iter().any(|m| m.user_id == membership.user_id) {
            return Ok(false);
        }
        entry.members.push(membership.clone());
        Ok(true)
    }

    async fn remove_member(&self, group: &GroupId, user: &UserId) -> Result<bool, StoreError> {
        let mut groups = self.groups.write();
        let Some(entry) = groups.get_mut(group) else {
            return Ok(false);
        };
        let before = entry.members.len();
        entry.members.retain(|m| &m.user_id != user);
        Ok(entry.members.len() < before)
    }

    async fn is_member(&self, group: &GroupId, user: &UserId) -> Result<bool, StoreError> {
        Ok(self
            .groups
            .read()
            .get(group)
            .is_some_and(|e| e.members.iter().any(|m| &m.user_id == user)))
    }

    async fn list_members(&self, group: &GroupId) -> Result<Vec<Membership>, StoreError> {
        Ok(self
            .groups
            .read()
            .get(group)
            .map(|e| e.members.clone())
            .unwrap_or_default())
    }
}
