//! Configuration management for Tessera replicas
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (TESSERA_* prefix, highest precedence)
//! 2. tessera.local.toml (gitignored, local overrides)
//! 3. tessera.toml (git-tracked, deployment config)
//! 4. ~/.config/tessera/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! Every loaded configuration is validated eagerly: a zero interval or an
//! out-of-range replica id is a deployment mistake, not something to retry.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Wire names of message kinds that may appear in `unsigned_allowed`.
pub const KNOWN_MESSAGE_KINDS: &[&str] = &[
    "PRE-PREPARE",
    "PREPARE",
    "COMMIT",
    "VIEW-CHANGE",
    "CHECKPOINT-SYNC",
    "STATE-REQUEST",
    "CLIENT-REQUEST",
    "MEMBERSHIP-UPDATE",
    "ACK",
    "FAULT-DETECTION",
];

/// Main Tessera configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub replica: ReplicaConfig,
    pub timeouts: TimeoutConfig,
    pub consensus: ConsensusConfig,
    pub peers: Vec<PeerConfig>,
}

/// Identity of the local replica within the deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub id: u32,
    /// Configured cluster size `N`; tolerates `⌊(N−1)/3⌋` faulty replicas.
    pub total_replicas: u32,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            id: 0,
            total_replicas: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Delay between re-forwards of an uncompleted client request.
    pub retry_interval_ms: u64,
    /// Retries before a client request completes with a failure response.
    pub retry_limit: u32,
    /// Silence after which a replica is reported faulty.
    pub fault_detection_interval_ms: u64,
    pub ack_timeout_ms: u64,
    /// Backstop for a stuck consensus round before state is resynchronized.
    pub consensus_phase_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 2_000,
            retry_limit: 3,
            fault_detection_interval_ms: 10_000,
            ack_timeout_ms: 10_000,
            consensus_phase_timeout_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn fault_detection_interval(&self) -> Duration {
        Duration::from_millis(self.fault_detection_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn consensus_phase_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus_phase_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// An opportunistic checkpoint is taken every this many executions.
    pub checkpoint_interval: u64,
    /// Message kinds accepted without a signature.
    pub unsigned_allowed: Vec<String>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10,
            unsigned_allowed: vec!["ACK".to_string()],
        }
    }
}

/// A peer replica and the address its transport listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: u32,
    pub address: String,
}

impl TesseraConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from a specific deployment directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Read and validate a single TOML file, without layering.
    pub fn from_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: TesseraConfig =
            toml::from_str(&raw).map_err(|source| ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for replica `id` of an `n`-replica local cluster.
    pub fn local_cluster(id: u32, total_replicas: u32) -> Self {
        Self {
            replica: ReplicaConfig { id, total_replicas },
            peers: (0..total_replicas)
                .filter(|peer| *peer != id)
                .map(|peer| PeerConfig {
                    id: peer,
                    address: format!("127.0.0.1:{}", 7400 + peer),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Maximum number of faulty replicas tolerated, `⌊(N−1)/3⌋`.
    pub fn max_faulty(&self) -> u32 {
        self.replica.total_replicas.saturating_sub(1) / 3
    }

    /// Rejects configurations that can never run correctly.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.replica.total_replicas == 0 {
            return invalid("replica.total_replicas must be at least 1".to_string());
        }
        if self.replica.id >= self.replica.total_replicas {
            return invalid(format!(
                "replica.id {} is outside 0..{}",
                self.replica.id, self.replica.total_replicas
            ));
        }

        let timeouts = &self.timeouts;
        for (name, value) in [
            ("timeouts.retry_interval_ms", timeouts.retry_interval_ms),
            (
                "timeouts.fault_detection_interval_ms",
                timeouts.fault_detection_interval_ms,
            ),
            ("timeouts.ack_timeout_ms", timeouts.ack_timeout_ms),
            (
                "timeouts.consensus_phase_timeout_ms",
                timeouts.consensus_phase_timeout_ms,
            ),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be positive"));
            }
        }
        if timeouts.retry_limit == 0 {
            return invalid("timeouts.retry_limit must be at least 1".to_string());
        }

        if self.consensus.checkpoint_interval == 0 {
            return invalid("consensus.checkpoint_interval must be positive".to_string());
        }
        if let Some(unknown) = self
            .consensus
            .unsigned_allowed
            .iter()
            .find(|kind| !KNOWN_MESSAGE_KINDS.contains(&kind.as_str()))
        {
            return invalid(format!("unknown message kind in unsigned_allowed: {unknown}"));
        }

        for peer in &self.peers {
            if peer.id >= self.replica.total_replicas {
                return invalid(format!("peer id {} is outside the cluster", peer.id));
            }
            if peer.id == self.replica.id {
                return invalid(format!("peer list contains the local replica {}", peer.id));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_config() {
        let config = TesseraConfig::default();
        assert_eq!(config.replica.total_replicas, 4);
        assert_eq!(config.timeouts.retry_limit, 3);
        assert_eq!(config.timeouts.ack_timeout(), Duration::from_secs(10));
        assert_eq!(config.consensus.checkpoint_interval, 10);
        assert_eq!(config.consensus.unsigned_allowed, vec!["ACK".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_local_cluster_peers_exclude_self() {
        let config = TesseraConfig::local_cluster(2, 4);
        let ids: Vec<u32> = config.peers.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![0, 1, 3]);
        assert!(config.validate().is_ok());
    }

    #[test_case(1, 0; "single replica")]
    #[test_case(4, 1; "four replicas")]
    #[test_case(7, 2; "seven replicas")]
    #[test_case(10, 3; "ten replicas")]
    fn test_max_faulty(total: u32, expected: u32) {
        let config = TesseraConfig::local_cluster(0, total);
        assert_eq!(config.max_faulty(), expected);
    }

    #[test]
    fn test_rejects_zero_replicas() {
        let mut config = TesseraConfig::default();
        config.replica.total_replicas = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_rejects_id_outside_cluster() {
        let mut config = TesseraConfig::default();
        config.replica.id = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut config = TesseraConfig::default();
        config.timeouts.fault_detection_interval_ms = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("fault_detection_interval_ms"));
    }

    #[test]
    fn test_rejects_unknown_unsigned_kind() {
        let mut config = TesseraConfig::default();
        config.consensus.unsigned_allowed.push("GOSSIP".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[replica\nid = ").expect("Failed to write config");

        assert!(matches!(
            TesseraConfig::from_file(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        assert!(matches!(
            TesseraConfig::from_file(dir.path().join("absent.toml")),
            Err(ConfigError::ReadError { .. })
        ));
    }
}
