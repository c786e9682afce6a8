//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files (file IO left to app).
//! Every reconciliation tunable lives here so client and server agree on the
//! windows they assume of each other.

use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Fixed server tick rate.
    pub tick_hz: u32,
    /// Player name (client only).
    pub player_name: String,

    /// Client heartbeat period, seconds.
    pub heartbeat_secs: u64,
    /// Minimum gap between user-initiated connection attempts, milliseconds.
    pub connect_cooldown_ms: u64,
    /// Reconnect backoff base delay, milliseconds.
    pub reconnect_base_ms: u64,
    /// Reconnect backoff cap, milliseconds.
    pub reconnect_cap_ms: u64,
    /// Reconnect attempts before giving up.
    pub reconnect_max_attempts: u32,

    /// Deadline for an in-flight entity creation, seconds.
    pub creation_timeout_secs: u64,
    /// Entity with no update for this long is evicted, seconds.
    pub entity_stale_secs: f32,
    /// Cadence of the client eviction sweep, seconds.
    pub sweep_interval_secs: f32,
    /// Session with no message for this long is dropped server-side, seconds.
    pub session_stale_secs: f32,
    /// Periodic corrective entity-list broadcast interval, seconds.
    pub sync_interval_secs: f32,

    /// Known entity is rewritten even without movement once this stale, ms.
    pub update_stale_ms: u64,
    /// Interpolation targets older than this are skipped, ms.
    pub target_stale_ms: u64,
    /// Displayed transform snaps instead of interpolating past this distance.
    pub teleport_distance: f32,
    /// Seen-coordinate set compaction interval, seconds.
    pub seen_compact_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 30,
            player_name: "Player".to_string(),
            heartbeat_secs: 5,
            connect_cooldown_ms: 1500,
            reconnect_base_ms: 1000,
            reconnect_cap_ms: 3000,
            reconnect_max_attempts: 5,
            creation_timeout_secs: 8,
            entity_stale_secs: 5.0,
            sweep_interval_secs: 2.0,
            session_stale_secs: 10.0,
            sync_interval_secs: 5.0,
            update_stale_ms: 1000,
            target_stale_ms: 1000,
            teleport_distance: 2.0,
            seen_compact_secs: 300,
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{"server_addr":"10.0.0.1:9"}"#).unwrap();
        assert_eq!(cfg.server_addr, "10.0.0.1:9");
        assert_eq!(cfg.reconnect_max_attempts, 5);
        assert_eq!(cfg.teleport_distance, 2.0);
    }
}
