//! Coordinator configuration.
//!
//! Two structs: [`TxConfig`] for the transaction manager (timeouts, sweep
//! and snapshot cadence, id density) and [`SnapshotConfig`] for the durable
//! state storage (directory, codec versions). Both follow the builder
//! pattern with `with_*` setters and a `for_testing()` constructor that
//! shrinks every interval so tests run fast.

use std::path::PathBuf;
use std::time::Duration;

/// Transaction manager configuration.
#[derive(Debug, Clone)]
pub struct TxConfig {
    /// Default timeout for SHORT transactions, seconds.
    pub default_timeout_secs: u32,
    /// Enforced ceiling for caller-supplied SHORT timeouts, seconds.
    pub max_timeout_secs: u32,
    /// Cadence of the expiration sweep, seconds.
    pub cleanup_interval_secs: u64,
    /// Cadence of periodic snapshots, seconds.
    pub snapshot_interval_secs: u64,
    /// How many old snapshots to keep on disk.
    pub snapshot_retain_count: usize,
    /// Id density: transaction ids allocated per millisecond. Must be
    /// stable across runs of the same coordinator.
    pub max_tx_per_ms: u64,
}

impl Default for TxConfig {
    fn default() -> Self {
        TxConfig {
            default_timeout_secs: 30,
            max_timeout_secs: 86_400,
            cleanup_interval_secs: 10,
            snapshot_interval_secs: 300,
            snapshot_retain_count: 10,
            max_tx_per_ms: crate::types::MAX_TX_PER_MS,
        }
    }
}

impl TxConfig {
    /// Configuration with short intervals for tests.
    pub fn for_testing() -> Self {
        TxConfig {
            default_timeout_secs: 30,
            max_timeout_secs: 300,
            cleanup_interval_secs: 1,
            snapshot_interval_secs: 3600,
            snapshot_retain_count: 3,
            ..Default::default()
        }
    }

    pub fn with_default_timeout_secs(mut self, secs: u32) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn with_max_timeout_secs(mut self, secs: u32) -> Self {
        self.max_timeout_secs = secs;
        self
    }

    pub fn with_cleanup_interval_secs(mut self, secs: u64) -> Self {
        self.cleanup_interval_secs = secs;
        self
    }

    pub fn with_snapshot_interval_secs(mut self, secs: u64) -> Self {
        self.snapshot_interval_secs = secs;
        self
    }

    pub fn with_snapshot_retain_count(mut self, count: usize) -> Self {
        self.snapshot_retain_count = count;
        self
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

/// Durable state storage configuration.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Directory holding `snapshot.<ts>` and `txlog.<ts>` files.
    pub dir: PathBuf,
    /// Snapshot codec versions accepted on read, ascending. The highest
    /// version is used for writing.
    pub codec_versions: Vec<u8>,
}

impl SnapshotConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SnapshotConfig {
            dir: dir.into(),
            codec_versions: vec![1, 2],
        }
    }

    pub fn with_codec_versions(mut self, versions: Vec<u8>) -> Self {
        self.codec_versions = versions;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = TxConfig::default();
        assert!(cfg.default_timeout_secs <= cfg.max_timeout_secs);
        assert!(cfg.max_tx_per_ms > 0);
        assert_eq!(cfg.cleanup_interval(), Duration::from_secs(10));
    }

    #[test]
    fn builder_chains() {
        let cfg = TxConfig::for_testing()
            .with_default_timeout_secs(5)
            .with_max_timeout_secs(10)
            .with_snapshot_retain_count(1);
        assert_eq!(cfg.default_timeout_secs, 5);
        assert_eq!(cfg.max_timeout_secs, 10);
        assert_eq!(cfg.snapshot_retain_count, 1);
    }

    #[test]
    fn snapshot_config_defaults_to_all_codecs() {
        let cfg = SnapshotConfig::new("/tmp/tx");
        assert_eq!(cfg.codec_versions, vec![1, 2]);
        assert_eq!(cfg.dir, PathBuf::from("/tmp/tx"));
    }
}
