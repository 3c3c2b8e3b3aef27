//! Group creation and membership, kept in the store with a cached member set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use parley_core::groups::{Group, Membership, Role};
use parley_core::ids::{GroupId, UserId};
use parley_store::{FastCache, GroupStore};

use crate::errors::ChatError;

const DEFAULT_MEMBERS_TTL: Duration = Duration::from_secs(300);

pub struct MembershipService {
    groups: Arc<dyn GroupStore>,
    cache: Arc<dyn FastCache>,
    members_ttl: Duration,
    /// Bumped on every membership change this process makes.
    generations: Mutex<HashMap<GroupId, u64>>,
}

impl MembershipService {
    pub fn new(groups: Arc<dyn GroupStore>, cache: Arc<dyn FastCache>) -> Self {
        Self {
            groups,
            cache,
            members_ttl: DEFAULT_MEMBERS_TTL,
            generations: Mutex::new(HashMap::new()),
        }
    }

    /// How long a cached member set is trusted. Bounds how stale a set
    /// written by another process can get.
    pub fn with_members_ttl(mut self, ttl: Duration) -> Self {
        self.members_ttl = ttl;
        self
    }

    /// Create a group owned by `owner`. Everyone in `members` joins as a
    /// plain member.
    pub async fn create_group(
        &self,
        owner: &UserId,
        name: &str,
        description: &str,
        members: &[UserId],
    ) -> Result<Group, ChatError> {
        let now = Utc::now().timestamp();
        let group = Group {
            id: GroupId::new(),
            name: name.to_string(),
            description: description.to_string(),
            owner_id: owner.clone(),
            created_at: now,
        };

        let mut rows = vec![Membership {
            group_id: group.id.clone(),
            user_id: owner.clone(),
            role: Role::Owner,
            joined_at: now,
        }];
        for user in members {
            if rows.iter().any(|m| &m.user_id == user) {
                continue;
            }
            rows.push(Membership {
                group_id: group.id.clone(),
                user_id: user.clone(),
                role: Role::Member,
                joined_at: now,
            });
        }

        self.groups.create_group(&group, &rows).await?;
        let ids: Vec<UserId> = rows.into_iter().map(|m| m.user_id).collect();
        if let Err(e) = self.cache.set_group_members(&group.id, &ids, self.members_ttl).await {
            warn!(group_id = %group.id, error = %e, "failed to cache group members");
        }
        info!(group_id = %group.id, owner = %owner, members = ids.len(), "group created");
        Ok(group)
    }

    /// Add `user` to an existing group. Returns false if already a member.
    pub async fn join(&self, group: &GroupId, user: &UserId) -> Result<bool, ChatError> {
        let _ = self.groups.get_group(group).await?;
        let added = self
            .groups
            .add_member(&Membership {
                group_id: group.clone(),
                user_id: user.clone(),
                role: Role::Member,
                joined_at: Utc::now().timestamp(),
            })
            .await?;
        if added {
            self.membership_changed(group).await;
        }
        Ok(added)
    }

    pub async fn leave(&self, group: &GroupId, user: &UserId) -> Result<(), ChatError> {
        if !self.groups.remove_member(group, user).await? {
            return Err(ChatError::NotMember {
                group_id: group.clone(),
                user_id: user.clone(),
            });
        }
        self.membership_changed(group).await;
        Ok(())
    }

    pub async fn is_member(&self, group: &GroupId, user: &UserId) -> Result<bool, ChatError> {
        Ok(self.members(group).await?.contains(user))
    }

    /// Member ids, from the cached set when present, otherwise from the store
    /// (re-warming the cache). Empty results are never cached.
    pub async fn members(&self, group: &GroupId) -> Result<Vec<UserId>, ChatError> {
        match self.cache.group_members(group).await {
            Ok(Some(set)) => return Ok(set.into_iter().collect()),
            Ok(None) => {}
            Err(e) => warn!(group_id = %group, error = %e, "member cache read failed"),
        }

        let generation = self.generation(group);
        let ids: Vec<UserId> = self
            .groups
            .list_members(group)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        if ids.is_empty() {
            return Ok(ids);
        }

        if let Err(e) = self.cache.set_group_members(group, &ids, self.members_ttl).await {
            warn!(group_id = %group, error = %e, "failed to cache group members");
        }
        // A join or leave that raced the store read may already have
        // invalidated; drop what we just wrote so the stale set cannot stick.
        if self.generation(group) != generation {
            debug!(group_id = %group, "membership changed during reload");
            self.invalidate(group).await;
        }
        Ok(ids)
    }

    fn generation(&self, group: &GroupId) -> u64 {
        self.generations.lock().get(group).copied().unwrap_or(0)
    }

    async fn membership_changed(&self, group: &GroupId) {
        *self.generations.lock().entry(group.clone()).or_insert(0) += 1;
        self.invalidate(group).await;
    }

    async fn invalidate(&self, group: &GroupId) {
        if let Err(e) = self.cache.invalidate_group_members(group).await {
            warn!(group_id = %group, error = %e, "failed to invalidate cached members");
        }
    }
}
