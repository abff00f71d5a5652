//! Configuration structures for ShaleDB.

use crate::error::{Result, ShaleError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Buffer replacement policy.
///
/// LRU wins for skewed or hotspot access patterns. MRU can win when a long
/// sequential scan would otherwise evict cold pages that are still needed.
/// The policy is a property of the buffer pool; changing it mid-run applies
/// to subsequent evictions only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplacementPolicy {
    /// Least recently used: victims are taken from the cold end.
    #[default]
    Lru,
    /// Most recently used: victims are taken from the hot end.
    Mru,
}

impl std::fmt::Display for ReplacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplacementPolicy::Lru => write!(f, "LRU"),
            ReplacementPolicy::Mru => write!(f, "MRU"),
        }
    }
}

/// Storage configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for data and index files.
    pub data_dir: PathBuf,
    /// Number of frames in the buffer pool.
    pub pool_frames: usize,
    /// Buffer replacement policy.
    pub policy: ReplacementPolicy,
    /// Enable fsync on header writes and file close.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            pool_frames: 20,
            policy: ReplacementPolicy::Lru,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pool_frames == 0 {
            return Err(ShaleError::Config(
                "pool_frames must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.pool_frames, 20);
        assert_eq!(config.policy, ReplacementPolicy::Lru);
        assert!(config.fsync_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_config_rejects_empty_pool() {
        let config = StorageConfig {
            pool_frames: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ShaleError::Config(_))));
    }

    #[test]
    fn test_policy_display() {
        assert_eq!(ReplacementPolicy::Lru.to_string(), "LRU");
        assert_eq!(ReplacementPolicy::Mru.to_string(), "MRU");
    }

    #[test]
    fn test_policy_default() {
        assert_eq!(ReplacementPolicy::default(), ReplacementPolicy::Lru);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = StorageConfig {
            data_dir: PathBuf::from("/tmp/shale"),
            pool_frames: 64,
            policy: ReplacementPolicy::Mru,
            fsync_enabled: false,
        };
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.data_dir, config.data_dir);
        assert_eq!(deserialized.pool_frames, 64);
        assert_eq!(deserialized.policy, ReplacementPolicy::Mru);
        assert!(!deserialized.fsync_enabled);
    }
}
