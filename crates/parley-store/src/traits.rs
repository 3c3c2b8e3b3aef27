use async_trait::async_trait;

use parley_core::groups::{Group, Membership};
use parley_core::ids::{GroupId, MessageId, UserId};
use parley_core::messages::{Message, MessageStatus};

use crate::error::StoreError;

/// Authoritative message record. Backends are interchangeable; callers never
/// branch on which one is active.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(&self, message: &Message) -> Result<(), StoreError>;

    /// `StoreError::NotFound` when no message has this id.
    async fn get_message(&self, id: &MessageId) -> Result<Message, StoreError>;

    /// Private messages addressed to `user` with ids greater than `after`,
    /// oldest first (timestamp, then id).
    async fn list_undelivered(
        &self,
        user: &UserId,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Apply `status` if it moves the message forward. Returns whether it did.
    async fn update_status(&self, id: &MessageId, status: MessageStatus) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Insert the group and its initial members atomically.
    async fn create_group(&self, group: &Group, members: &[Membership]) -> Result<(), StoreError>;

    async fn get_group(&self, id: &GroupId) -> Result<Group, StoreError>;

    /// Returns false if the user was already a member.
    async fn add_member(&self, membership: &Membership) -> Result<bool, StoreError>;

    /// Returns false if the user was not a member.
    async fn remove_member(&self, group: &GroupId, user: &UserId) -> Result<bool, StoreError>;

    async fn is_member(&self, group: &GroupId, user: &UserId) -> Result<bool, StoreError>;

    async fn list_members(&self, group: &GroupId) -> Result<Vec<Membership>, StoreError>;
}
