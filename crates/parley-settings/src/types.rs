//! Settings structs and their compiled defaults.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub session: SessionSettings,
    pub delivery: DeliverySettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub auth: AuthSettings,
}

impl Settings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.session;
        if s.outbound_capacity == 0 {
            return Err(invalid("session.outbound_capacity must be positive"));
        }
        if s.max_frame_bytes == 0 {
            return Err(invalid("session.max_frame_bytes must be positive"));
        }
        if s.read_deadline_secs == 0 || s.write_deadline_secs == 0 || s.ping_interval_secs == 0 {
            return Err(invalid("session deadlines and ping interval must be positive"));
        }
        if s.ping_interval_secs >= s.read_deadline_secs {
            return Err(invalid(format!(
                "session.ping_interval_secs ({}) must be below session.read_deadline_secs ({})",
                s.ping_interval_secs, s.read_deadline_secs
            )));
        }

        let d = &self.delivery;
        if d.private_topic.is_empty() || d.group_topic.is_empty() || d.consumer_group.is_empty() {
            return Err(invalid("delivery topics and consumer group must be non-empty"));
        }
        if d.sync_default_limit == 0 || d.sync_default_limit > d.sync_max_limit {
            return Err(invalid(format!(
                "delivery.sync_default_limit ({}) must be in 1..={}",
                d.sync_default_limit, d.sync_max_limit
            )));
        }
        if d.offline_list_max == 0 {
            return Err(invalid("delivery.offline_list_max must be positive"));
        }
        if d.cache_sweep_secs == 0 || d.group_members_ttl_secs == 0 {
            return Err(invalid("delivery cache sweep interval and member set TTL must be positive"));
        }

        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite_path.is_empty() {
            return Err(invalid("storage.sqlite_path is required for the sqlite backend"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> SettingsError {
    SettingsError::InvalidValue(msg.into())
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Per-connection limits and timers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Envelopes buffered per connection before sends fail with backpressure.
    pub outbound_capacity: usize,
    /// Largest inbound frame accepted; anything bigger closes the connection.
    pub max_frame_bytes: usize,
    /// Silence allowed from the peer before the connection is dropped.
    pub read_deadline_secs: u64,
    /// Interval between liveness pings. Must be below `read_deadline_secs`.
    pub ping_interval_secs: u64,
    /// Upper bound on a single outbound write.
    pub write_deadline_secs: u64,
    /// Time given to in-flight writes after close before the transport is dropped.
    pub close_grace_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            max_frame_bytes: 512,
            read_deadline_secs: 60,
            ping_interval_secs: 54,
            write_deadline_secs: 10,
            close_grace_ms: 1_000,
        }
    }
}

impl SessionSettings {
    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Offline path, cache lifetimes and sync paging.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// Durable-queue topic for private messages that missed a live push.
    pub private_topic: String,
    /// Durable-queue topic for group messages.
    pub group_topic: String,
    /// Consumer group this process reads both topics under.
    pub consumer_group: String,
    /// Cap on each user's cached offline list.
    pub offline_list_max: usize,
    pub offline_ttl_secs: u64,
    pub message_cache_ttl_secs: u64,
    pub presence_ttl_secs: u64,
    /// How long a cached group member set is trusted before the store is
    /// read again.
    pub group_members_ttl_secs: u64,
    /// Interval of the background sweep that drops expired cache entries.
    pub cache_sweep_secs: u64,
    /// Used when a sync request asks for zero messages.
    pub sync_default_limit: usize,
    pub sync_max_limit: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            private_topic: "offline_msg".to_string(),
            group_topic: "group_chat".to_string(),
            consumer_group: "parley".to_string(),
            offline_list_max: 1_000,
            offline_ttl_secs: 7 * 24 * 3600,
            message_cache_ttl_secs: 3600,
            presence_ttl_secs: 30 * 60,
            group_members_ttl_secs: 300,
            cache_sweep_secs: 60,
            sync_default_limit: 50,
            sync_max_limit: 500,
        }
    }
}

impl DeliverySettings {
    pub fn offline_ttl(&self) -> Duration {
        Duration::from_secs(self.offline_ttl_secs)
    }

    pub fn message_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.message_cache_ttl_secs)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn group_members_ttl(&self) -> Duration {
        Duration::from_secs(self.group_members_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_secs)
    }
}

/// Which message/group store backs the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub sqlite_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: format!("{home}/.parley/parley.db"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Base level: trace, debug, info, warn or error.
    pub level: String,
    pub format: LogFormat,
    /// Per-target overrides, e.g. `{"parley_server::pump": "debug"}`.
    pub modules: HashMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            modules: HashMap::new(),
        }
    }
}

/// Static login credentials. Empty means every login is accepted.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// user id -> token
    pub tokens: HashMap<String, String>,
}
