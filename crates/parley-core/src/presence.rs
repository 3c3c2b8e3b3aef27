use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// What the fast cache remembers about a logged-in user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(default)]
    pub platform: String,
    pub connection_id: ConnectionId,
    /// Unix seconds.
    pub last_seen: i64,
}
