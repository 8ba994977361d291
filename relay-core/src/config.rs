//! Relay configuration with documented defaults
//!
//! All timings are overridable; defaults match the documented behavior of
//! the transport layer (10s connect timeout, 10s heartbeat, 30s failover
//! threshold, exponential backoff capped at 60s).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::{RelayError, RelayResult};

/// Addresses and store paths for the backup queue pool
///
/// A `None` entry disables that backup channel. Defaults enable the two
/// durable stores under `data/` so the relay can always degrade to local
/// persistence even with no backup network endpoints configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupChannels {
    #[serde(default)]
    pub push_stream_address: Option<String>,
    #[serde(default)]
    pub poll_address: Option<String>,
    #[serde(default = "default_flat_log_path")]
    pub flat_log_path: Option<PathBuf>,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: Option<PathBuf>,
}

impl BackupChannels {
    /// No backup channels at all (the relay degrades to no-op sends when
    /// every primary endpoint is down)
    pub fn none() -> Self {
        Self {
            push_stream_address: None,
            poll_address: None,
            flat_log_path: None,
            sqlite_path: None,
        }
    }
}

impl Default for BackupChannels {
    fn default() -> Self {
        Self {
            push_stream_address: None,
            poll_address: None,
            flat_log_path: default_flat_log_path(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_flat_log_path() -> Option<PathBuf> {
    Some(PathBuf::from("data/relay-backup.log"))
}

fn default_sqlite_path() -> Option<PathBuf> {
    Some(PathBuf::from("data/relay-backup.db"))
}

/// Configuration for the whole transport layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Priority-ordered endpoint pool (primary priority 1, secondaries >= 2)
    pub endpoints: Vec<Endpoint>,

    /// Bound on a single connection attempt; the attempt is cancelled on
    /// expiry, never orphaned
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Interval between heartbeat pings on the active connection
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Interval of the health-check tick driving failover decisions
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Missing a pong for this long marks the connection unhealthy
    #[serde(default = "default_failover_threshold_ms")]
    pub failover_threshold_ms: u64,

    /// Reconnect attempts before the channel transitions to failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Bound on the backup queue; oldest entries are evicted first
    #[serde(default = "default_backup_max_queue_size")]
    pub backup_max_queue_size: usize,

    #[serde(default = "default_backup_sync_interval_ms")]
    pub backup_sync_interval_ms: u64,

    /// Interval of the poll-kind transport's GET loop
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub backup: BackupChannels,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_heartbeat_interval_ms() -> u64 {
    10_000
}
fn default_health_check_interval_ms() -> u64 {
    5_000
}
fn default_failover_threshold_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_backoff_ms() -> u64 {
    2_000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_backup_max_queue_size() -> usize {
    1_000
}
fn default_backup_sync_interval_ms() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    2_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            failover_threshold_ms: default_failover_threshold_ms(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backup_max_queue_size: default_backup_max_queue_size(),
            backup_sync_interval_ms: default_backup_sync_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            backup: BackupChannels::default(),
        }
    }
}

impl RelayConfig {
    /// Config with an endpoint pool and defaults everywhere else
    pub fn with_endpoints(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            ..Self::default()
        }
    }

    /// Load from a JSON file, falling back to the `RELAY_CONFIG` env var
    /// for the path when none is given
    pub fn load(path: Option<&std::path::Path>) -> RelayResult<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("RELAY_CONFIG")
                .map(PathBuf::from)
                .map_err(|_| RelayError::config("no config path and RELAY_CONFIG unset"))?,
        };
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| RelayError::config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| RelayError::config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the coordinator cannot run with
    pub fn validate(&self) -> RelayResult<()> {
        if self.endpoints.is_empty() {
            return Err(RelayError::config("at least one endpoint is required"));
        }
        let mut ids: Vec<&str> = self.endpoints.iter().map(|e| e.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.endpoints.len() {
            return Err(RelayError::config("duplicate endpoint ids"));
        }
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("failover_threshold_ms", self.failover_threshold_ms),
            ("base_backoff_ms", self.base_backoff_ms),
            ("max_backoff_ms", self.max_backoff_ms),
            ("backup_sync_interval_ms", self.backup_sync_interval_ms),
            ("poll_interval_ms", self.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(RelayError::config(format!("{name} must be nonzero")));
            }
        }
        if self.backup_max_queue_size == 0 {
            return Err(RelayError::config("backup_max_queue_size must be nonzero"));
        }
        Ok(())
    }

    /// Endpoints sorted by ascending priority
    pub fn sorted_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = self.endpoints.clone();
        endpoints.sort();
        endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointKind;

    fn endpoint(id: &str, priority: u8) -> Endpoint {
        Endpoint::new(id, format!("wss://{id}.example"), EndpointKind::WebSocket, priority)
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = RelayConfig::default();
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.heartbeat_interval_ms, 10_000);
        assert_eq!(config.health_check_interval_ms, 5_000);
        assert_eq!(config.failover_threshold_ms, 30_000);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_backoff_ms, 2_000);
        assert_eq!(config.max_backoff_ms, 60_000);
        assert_eq!(config.backup_max_queue_size, 1_000);
        assert_eq!(config.backup_sync_interval_ms, 10_000);
    }

    #[test]
    fn validate_rejects_empty_pool_and_duplicate_ids() {
        assert!(RelayConfig::default().validate().is_err());

        let config = RelayConfig::with_endpoints(vec![endpoint("a", 1), endpoint("a", 2)]);
        assert!(config.validate().is_err());

        let config = RelayConfig::with_endpoints(vec![endpoint("a", 1), endpoint("b", 2)]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{
            "endpoints": [
                {"id": "primary", "address": "wss://x", "kind": "web_socket", "priority": 1}
            ],
            "failoverThresholdMs": 15000
        }"#;
        // serde field names are snake_case; the camelCase key is ignored
        let config: RelayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.failover_threshold_ms, 30_000);
        assert!(config.backup.flat_log_path.is_some());
    }
}
