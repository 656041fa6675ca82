//! Runtime configuration
//!
//! A plain struct with a `Default` impl; no file-loading is in scope here
//! (that lives above this crate).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Every recognized configuration option, plus the `SnapshotMaxSizeBytes`
/// compaction trigger this implementation adds.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,
    pub bind_addr: SocketAddr,
    pub tags: HashMap<String, String>,
    pub protocol_version: u8,

    pub broadcast_timeout: Duration,
    pub leave_propagate_delay: Duration,

    pub event_buffer: usize,
    pub query_buffer: usize,

    pub reap_interval: Duration,
    pub recent_intent_timeout: Duration,
    pub reconnect_interval: Duration,
    pub reconnect_timeout: Duration,
    pub tombstone_timeout: Duration,
    pub flap_timeout: Duration,
    pub queue_check_interval: Duration,

    pub queue_depth_warning: usize,
    pub max_queue_depth: usize,
    pub min_queue_depth: usize,

    pub query_timeout_mult: u32,
    pub query_response_size_limit: usize,
    pub query_size_limit: usize,
    pub user_event_size_limit: usize,

    pub enable_name_conflict_resolution: bool,
    pub disable_coordinates: bool,
    pub validate_node_names: bool,
    pub rejoin_after_leave: bool,
    pub coalesce_period: Duration,
    pub quiescent_period: Duration,
    pub user_coalesce_period: Duration,
    pub user_quiescent_period: Duration,

    pub snapshot_path: Option<PathBuf>,
    /// Compaction trigger: rewrite the snapshot once it exceeds this many
    /// bytes.
    pub snapshot_max_size_bytes: u64,
    pub keyring_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            bind_addr: "0.0.0.0:7946".parse().unwrap(),
            tags: HashMap::new(),
            protocol_version: 5,

            broadcast_timeout: Duration::from_secs(5),
            leave_propagate_delay: Duration::from_millis(1000),

            event_buffer: 512,
            query_buffer: 512,

            reap_interval: Duration::from_secs(15),
            recent_intent_timeout: Duration::from_secs(5 * 60),
            reconnect_interval: Duration::from_secs(30),
            reconnect_timeout: Duration::from_secs(24 * 60 * 60),
            tombstone_timeout: Duration::from_secs(24 * 60 * 60),
            flap_timeout: Duration::from_secs(60),
            queue_check_interval: Duration::from_secs(30),

            queue_depth_warning: 128,
            max_queue_depth: 4096,
            min_queue_depth: 0,

            query_timeout_mult: 16,
            query_response_size_limit: 1024,
            query_size_limit: 1024,
            user_event_size_limit: 512,

            enable_name_conflict_resolution: true,
            disable_coordinates: false,
            validate_node_names: true,
            rejoin_after_leave: false,
            coalesce_period: Duration::from_millis(200),
            quiescent_period: Duration::from_millis(50),
            user_coalesce_period: Duration::from_millis(200),
            user_quiescent_period: Duration::from_millis(50),

            snapshot_path: None,
            snapshot_max_size_bytes: 128 * 1024,
            keyring_file: None,
        }
    }
}

impl Config {
    /// Default query deadline: `GossipInterval * Mult * log10(N+1)`.
    pub fn query_timeout(&self, gossip_interval: Duration, num_members: usize) -> Duration {
        let factor = (num_members as f64 + 1.0).log10().max(0.0);
        gossip_interval.mul_f64(self.query_timeout_mult as f64 * factor.max(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = Config::default();
        assert!(cfg.protocol_version >= 2 && cfg.protocol_version <= 5);
        assert!(cfg.user_event_size_limit <= cfg.query_size_limit.max(cfg.user_event_size_limit));
    }

    #[test]
    fn query_timeout_grows_with_cluster_size() {
        let cfg = Config::default();
        let small = cfg.query_timeout(Duration::from_millis(200), 1);
        let large = cfg.query_timeout(Duration::from_millis(200), 1000);
        assert!(large > small);
    }
}
