//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `PARLEY_*` environment variable overrides
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{LogFormat, Settings, StorageBackend};

/// Resolve the default settings file (`~/.parley/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a configuration that
/// fails [`Settings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    load_with(path, |name| std::env::var(name).ok())
}

fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, lookup);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PARLEY_*` overrides read through `lookup`.
///
/// Values that fail to parse or fall outside their range are ignored with a
/// warning.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("PARLEY_PORT", 0, 65535) {
        settings.server.port = v;
    }

    // ── Session ─────────────────────────────────────────────────────
    if let Some(v) = env.usize("PARLEY_OUTBOUND_CAPACITY", 1, 1_000_000) {
        settings.session.outbound_capacity = v;
    }
    if let Some(v) = env.usize("PARLEY_MAX_FRAME_BYTES", 64, 64 * 1024 * 1024) {
        settings.session.max_frame_bytes = v;
    }
    if let Some(v) = env.u64("PARLEY_READ_DEADLINE_SECS", 1, 86_400) {
        settings.session.read_deadline_secs = v;
    }
    if let Some(v) = env.u64("PARLEY_PING_INTERVAL_SECS", 1, 86_400) {
        settings.session.ping_interval_secs = v;
    }
    if let Some(v) = env.u64("PARLEY_WRITE_DEADLINE_SECS", 1, 3_600) {
        settings.session.write_deadline_secs = v;
    }

    // ── Delivery ────────────────────────────────────────────────────
    if let Some(v) = env.string("PARLEY_CONSUMER_GROUP") {
        settings.delivery.consumer_group = v;
    }
    if let Some(v) = env.usize("PARLEY_SYNC_DEFAULT_LIMIT", 1, 10_000) {
        settings.delivery.sync_default_limit = v;
    }

    // ── Storage ─────────────────────────────────────────────────────
    if let Some(v) = env.string("PARLEY_STORAGE_BACKEND") {
        match parse_backend(&v) {
            Some(backend) => settings.storage.backend = backend,
            None => tracing::warn!(key = "PARLEY_STORAGE_BACKEND", value = %v, "unknown backend, ignoring"),
        }
    }
    if let Some(v) = env.string("PARLEY_SQLITE_PATH") {
        settings.storage.sqlite_path = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("PARLEY_LOG_FORMAT") {
        match parse_format(&v) {
            Some(format) => settings.logging.format = format,
            None => tracing::warn!(key = "PARLEY_LOG_FORMAT", value = %v, "unknown log format, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_backend(val: &str) -> Option<StorageBackend> {
    match val.to_lowercase().as_str() {
        "sqlite" => Some(StorageBackend::Sqlite),
        "memory" => Some(StorageBackend::Memory),
        _ => None,
    }
}

pub fn parse_format(val: &str) -> Option<LogFormat> {
    match val.to_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

// ── Env readers (thin wrappers) ─────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
