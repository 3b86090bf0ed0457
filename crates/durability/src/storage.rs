//! Durable state storage: snapshot files plus edit log segments.
//!
//! Storage coordinates the filesystem layout under one directory:
//!
//! ```text
//! snapshot.<timestamp>        # atomic rename target
//! snapshot.<timestamp>.tmp    # pre-rename scratch
//! txlog.<timestamp>           # edit log segment, one per snapshot epoch
//! ```
//!
//! Snapshots are written to the `.tmp` name, fsynced and renamed into
//! place, so concurrent readers only ever observe fully-formed files.
//! Two implementations exist: [`LocalFileTxStorage`] for real coordinators
//! and [`InMemoryTxStorage`] for tests and ephemeral embedded use.

use crate::codec::{SnapshotCodecProvider, SnapshotError};
use crate::edit::TransactionEdit;
use crate::log::{
    EditLogFormat, EditLogReader, EditLogWriter, InMemoryTransactionLog, SyncPolicy,
    TransactionLog,
};
use crate::snapshot::{TransactionSnapshot, TransactionVisibilityState};
use keystone_core::{Result, SnapshotConfig, TxError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SNAPSHOT_PREFIX: &str = "snapshot.";
const TMP_SUFFIX: &str = ".tmp";
const LOG_PREFIX: &str = "txlog.";

/// Storage for the coordinator's durable state.
pub trait TxStateStorage: Send + Sync {
    /// Persist a snapshot; visible to readers only once fully written.
    fn write_snapshot(&self, snapshot: &TransactionSnapshot) -> Result<()>;

    /// Newest decodable snapshot, if any exists.
    fn latest_snapshot(&self) -> Result<Option<TransactionSnapshot>>;

    /// Visibility prefix of the newest snapshot; succeeds even when the
    /// snapshot's change-set tail is corrupt.
    fn latest_snapshot_visibility(&self) -> Result<Option<TransactionVisibilityState>>;

    /// Open a fresh log segment for the epoch starting at `timestamp`.
    fn create_log(&self, timestamp: i64) -> Result<Box<dyn TransactionLog>>;

    /// All durable edits from segments with timestamp >= `timestamp`,
    /// in log order.
    fn edits_since(&self, timestamp: i64) -> Result<Vec<TransactionEdit>>;

    /// Timestamp of the newest existing log segment, if any. New segments
    /// must be created strictly after it so names never collide.
    fn latest_log_timestamp(&self) -> Result<Option<i64>>;

    /// Delete log segments older than `timestamp`. Returns how many.
    fn delete_logs_older_than(&self, timestamp: i64) -> Result<usize>;

    /// Keep only the newest `count` snapshots. Returns how many were
    /// deleted.
    fn retain_snapshots(&self, count: usize) -> Result<usize>;

    /// Human-readable location for logs and status output.
    fn location(&self) -> String;
}

// ============================================================================
// Local filesystem storage
// ============================================================================

/// Snapshot + log storage rooted at a local directory.
pub struct LocalFileTxStorage {
    dir: PathBuf,
    provider: SnapshotCodecProvider,
    sync_policy: SyncPolicy,
}

impl LocalFileTxStorage {
    /// Open (creating the directory if needed) with the default sync
    /// policy.
    pub fn new(config: &SnapshotConfig) -> Result<Self> {
        Self::with_sync_policy(config, SyncPolicy::Always)
    }

    pub fn with_sync_policy(config: &SnapshotConfig, sync_policy: SyncPolicy) -> Result<Self> {
        fs::create_dir_all(&config.dir)
            .map_err(|e| TxError::snapshot_failure_with_source("cannot create snapshot dir", e))?;
        let provider = SnapshotCodecProvider::from_versions(&config.codec_versions)
            .map_err(TxError::from)?;
        info!(dir = %config.dir.display(), "opened transaction state storage");
        Ok(LocalFileTxStorage {
            dir: config.dir.clone(),
            provider,
            sync_policy,
        })
    }

    fn snapshot_path(&self, timestamp: i64) -> PathBuf {
        self.dir.join(format!("{SNAPSHOT_PREFIX}{timestamp}"))
    }

    fn log_path(&self, timestamp: i64) -> PathBuf {
        self.dir.join(format!("{LOG_PREFIX}{timestamp}"))
    }

    /// Timestamps of files with the given prefix, ascending. `.tmp`
    /// leftovers from crashed snapshot writes are skipped.
    fn list_timestamps(&self, prefix: &str) -> Result<Vec<i64>> {
        let mut stamps = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| TxError::snapshot_failure_with_source("cannot list state dir", e))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| TxError::snapshot_failure_with_source("cannot list state dir", e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            if let Some(stamp) = name.strip_prefix(prefix) {
                if let Ok(ts) = stamp.parse::<i64>() {
                    stamps.push(ts);
                }
            }
        }
        stamps.sort_unstable();
        Ok(stamps)
    }

    fn read_latest_snapshot_bytes(&self) -> Result<Option<Vec<u8>>> {
        let stamps = self.list_timestamps(SNAPSHOT_PREFIX)?;
        let Some(&latest) = stamps.last() else {
            return Ok(None);
        };
        let path = self.snapshot_path(latest);
        let bytes = fs::read(&path)
            .map_err(|e| TxError::snapshot_failure_with_source("cannot read snapshot", e))?;
        Ok(Some(bytes))
    }
}

impl TxStateStorage for LocalFileTxStorage {
    fn write_snapshot(&self, snapshot: &TransactionSnapshot) -> Result<()> {
        let bytes = self.provider.encode(snapshot);
        let final_path = self.snapshot_path(snapshot.timestamp);
        let tmp_path = self
            .dir
            .join(format!("{SNAPSHOT_PREFIX}{}{TMP_SUFFIX}", snapshot.timestamp));

        let write = |path: &Path| -> std::result::Result<(), SnapshotError> {
            let mut file = fs::File::create(path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            Ok(())
        };
        write(&tmp_path).map_err(TxError::from)?;
        fs::rename(&tmp_path, &final_path)
            .map_err(|e| TxError::snapshot_failure_with_source("cannot rename snapshot", e))?;
        info!(
            path = %final_path.display(),
            bytes = bytes.len(),
            "wrote snapshot"
        );
        Ok(())
    }

    fn latest_snapshot(&self) -> Result<Option<TransactionSnapshot>> {
        match self.read_latest_snapshot_bytes()? {
            None => Ok(None),
            Some(bytes) => Ok(Some(self.provider.decode(&bytes).map_err(TxError::from)?)),
        }
    }

    fn latest_snapshot_visibility(&self) -> Result<Option<TransactionVisibilityState>> {
        match self.read_latest_snapshot_bytes()? {
            None => Ok(None),
            Some(bytes) => Ok(Some(
                self.provider
                    .decode_visibility(&bytes)
                    .map_err(TxError::from)?,
            )),
        }
    }

    fn create_log(&self, timestamp: i64) -> Result<Box<dyn TransactionLog>> {
        let writer = EditLogWriter::create(
            self.log_path(timestamp),
            timestamp,
            EditLogFormat::V2,
            self.sync_policy,
        )?;
        Ok(Box::new(writer))
    }

    fn edits_since(&self, timestamp: i64) -> Result<Vec<TransactionEdit>> {
        let mut edits = Vec::new();
        for ts in self.list_timestamps(LOG_PREFIX)? {
            if ts < timestamp {
                continue;
            }
            let path = self.log_path(ts);
            debug!(path = %path.display(), "replaying edit log segment");
            edits.extend(EditLogReader::read_file(&path)?);
        }
        Ok(edits)
    }

    fn latest_log_timestamp(&self) -> Result<Option<i64>> {
        Ok(self.list_timestamps(LOG_PREFIX)?.last().copied())
    }

    fn delete_logs_older_than(&self, timestamp: i64) -> Result<usize> {
        let mut deleted = 0;
        for ts in self.list_timestamps(LOG_PREFIX)? {
            if ts >= timestamp {
                continue;
            }
            let path = self.log_path(ts);
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    debug!(path = %path.display(), "deleted old edit log segment");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cannot delete old log"),
            }
        }
        Ok(deleted)
    }

    fn retain_snapshots(&self, count: usize) -> Result<usize> {
        let stamps = self.list_timestamps(SNAPSHOT_PREFIX)?;
        if stamps.len() <= count {
            return Ok(0);
        }
        let mut deleted = 0;
        for &ts in &stamps[..stamps.len() - count] {
            let path = self.snapshot_path(ts);
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    debug!(path = %path.display(), "deleted old snapshot");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cannot delete old snapshot"),
            }
        }
        Ok(deleted)
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

// ============================================================================
// In-memory storage
// ============================================================================

#[derive(Default)]
struct InMemoryInner {
    snapshots: BTreeMap<i64, TransactionSnapshot>,
    logs: BTreeMap<i64, Arc<Mutex<Vec<TransactionEdit>>>>,
}

/// Storage that keeps everything in memory. State survives manager
/// restarts that share the storage handle, which is exactly what recovery
/// tests need; it does not survive the process.
#[derive(Default)]
pub struct InMemoryTxStorage {
    inner: Mutex<InMemoryInner>,
}

impl InMemoryTxStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained snapshots (test observability).
    pub fn snapshot_count(&self) -> usize {
        self.inner.lock().snapshots.len()
    }

    /// Number of retained log segments (test observability).
    pub fn log_count(&self) -> usize {
        self.inner.lock().logs.len()
    }
}

impl TxStateStorage for InMemoryTxStorage {
    fn write_snapshot(&self, snapshot: &TransactionSnapshot) -> Result<()> {
        self.inner
            .lock()
            .snapshots
            .insert(snapshot.timestamp, snapshot.clone());
        Ok(())
    }

    fn latest_snapshot(&self) -> Result<Option<TransactionSnapshot>> {
        Ok(self
            .inner
            .lock()
            .snapshots
            .values()
            .next_back()
            .cloned())
    }

    fn latest_snapshot_visibility(&self) -> Result<Option<TransactionVisibilityState>> {
        Ok(self.latest_snapshot()?.map(|s| s.visibility_state()))
    }

    fn create_log(&self, timestamp: i64) -> Result<Box<dyn TransactionLog>> {
        let edits = Arc::new(Mutex::new(Vec::new()));
        self.inner.lock().logs.insert(timestamp, edits.clone());
        Ok(Box::new(InMemoryTransactionLog::new(timestamp, edits)))
    }

    fn edits_since(&self, timestamp: i64) -> Result<Vec<TransactionEdit>> {
        let inner = self.inner.lock();
        let mut edits = Vec::new();
        for (_, log) in inner.logs.range(timestamp..) {
            edits.extend(log.lock().iter().cloned());
        }
        Ok(edits)
    }

    fn latest_log_timestamp(&self) -> Result<Option<i64>> {
        Ok(self.inner.lock().logs.keys().next_back().copied())
    }

    fn delete_logs_older_than(&self, timestamp: i64) -> Result<usize> {
        let mut inner = self.inner.lock();
        let keep = inner.logs.split_off(&timestamp);
        let deleted = inner.logs.len();
        inner.logs = keep;
        Ok(deleted)
    }

    fn retain_snapshots(&self, count: usize) -> Result<usize> {
        let mut inner = self.inner.lock();
        let excess = inner.snapshots.len().saturating_sub(count);
        let drop_keys: Vec<i64> = inner.snapshots.keys().take(excess).copied().collect();
        for key in &drop_keys {
            inner.snapshots.remove(key);
        }
        Ok(drop_keys.len())
    }

    fn location(&self) -> String {
        "<memory>".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> LocalFileTxStorage {
        LocalFileTxStorage::new(&SnapshotConfig::new(dir.path())).unwrap()
    }

    fn snapshot_at(timestamp: i64, write_pointer: u64) -> TransactionSnapshot {
        TransactionSnapshot {
            timestamp,
            write_pointer,
            read_pointer: write_pointer,
            ..TransactionSnapshot::empty()
        }
    }

    #[test]
    fn snapshot_round_trip_through_files() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        assert!(storage.latest_snapshot().unwrap().is_none());

        storage.write_snapshot(&snapshot_at(100, 5)).unwrap();
        storage.write_snapshot(&snapshot_at(200, 9)).unwrap();

        let latest = storage.latest_snapshot().unwrap().unwrap();
        assert_eq!(latest.timestamp, 200);
        assert_eq!(latest.write_pointer, 9);

        let vis = storage.latest_snapshot_visibility().unwrap().unwrap();
        assert_eq!(vis.write_pointer, 9);
    }

    #[test]
    fn tmp_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage.write_snapshot(&snapshot_at(100, 5)).unwrap();
        // A crashed write leaves a .tmp behind with a newer stamp.
        fs::write(dir.path().join("snapshot.900.tmp"), b"garbage").unwrap();

        let latest = storage.latest_snapshot().unwrap().unwrap();
        assert_eq!(latest.timestamp, 100);
    }

    #[test]
    fn log_lifecycle_and_replay_window() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);

        let mut log1 = storage.create_log(100).unwrap();
        log1.append(&[TransactionEdit::Aborted { tx_id: 1 }]).unwrap();
        log1.close().unwrap();

        let mut log2 = storage.create_log(200).unwrap();
        log2.append(&[TransactionEdit::Aborted { tx_id: 2 }]).unwrap();
        log2.close().unwrap();

        assert_eq!(storage.edits_since(0).unwrap().len(), 2);
        assert_eq!(storage.edits_since(150).unwrap().len(), 1);
        assert_eq!(storage.edits_since(200).unwrap().len(), 1);
        assert_eq!(storage.edits_since(201).unwrap().len(), 0);

        assert_eq!(storage.delete_logs_older_than(200).unwrap(), 1);
        assert_eq!(storage.edits_since(0).unwrap().len(), 1);
    }

    #[test]
    fn snapshot_retention_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        for ts in [100, 200, 300, 400] {
            storage.write_snapshot(&snapshot_at(ts, ts as u64)).unwrap();
        }
        assert_eq!(storage.retain_snapshots(2).unwrap(), 2);
        assert_eq!(storage.list_timestamps(SNAPSHOT_PREFIX).unwrap(), vec![300, 400]);
        // Already within the limit: nothing deleted.
        assert_eq!(storage.retain_snapshots(2).unwrap(), 0);
    }

    #[test]
    fn in_memory_storage_mirrors_file_semantics() {
        let storage = InMemoryTxStorage::new();
        storage.write_snapshot(&snapshot_at(100, 5)).unwrap();
        storage.write_snapshot(&snapshot_at(200, 9)).unwrap();
        assert_eq!(storage.latest_snapshot().unwrap().unwrap().timestamp, 200);

        let mut log = storage.create_log(100).unwrap();
        log.append(&[TransactionEdit::Invalid { tx_id: 9 }]).unwrap();
        assert_eq!(storage.edits_since(0).unwrap().len(), 1);
        assert_eq!(storage.edits_since(101).unwrap().len(), 0);

        assert_eq!(storage.retain_snapshots(1).unwrap(), 1);
        assert_eq!(storage.snapshot_count(), 1);
        assert_eq!(storage.delete_logs_older_than(500).unwrap(), 1);
        assert_eq!(storage.log_count(), 0);
    }
}
