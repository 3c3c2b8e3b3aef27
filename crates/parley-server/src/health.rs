//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is accepting connections.
    pub status: String,
    pub uptime_secs: u64,
    /// Registered sessions, logged in or not.
    pub connections: usize,
    /// Users with a bound session.
    pub online_users: usize,
}

pub fn health_check(start_time: Instant, connections: usize, online_users: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        online_users,
    }
}
