//! Append-only edit log segments with group commit.
//!
//! One segment file per snapshot epoch, named `txlog.<timestamp>`. The
//! writer appends edits in groups; each group is preceded by a commit
//! marker carrying the group size, and every frame is CRC32-protected:
//!
//! ```text
//! [magic "KTXL" (4)][version (1)]
//! repeated {
//!     marker frame:  [len(4)] [0x02 count(4)]        [crc32(4)]
//!     n edit frames: [len(4)] [0x01 seq(8) edit...]  [crc32(4)]
//! }
//! ```
//!
//! `len` counts everything after itself including the CRC; the CRC covers
//! the content between them. A reader that sees a marker announcing `n`
//! records but finds fewer intact ones discards that whole group and stops:
//! the torn tail of a crashed writer never reaches replay. Version-1 logs
//! have no markers; the reader simply truncates at the first bad frame.
//!
//! ## Durability contract
//!
//! `append` returns only after the group is written and flushed; with
//! [`SyncPolicy::Always`] (the default) it is also fsynced, so a true
//! return from a commit operation implies the COMMITTED edit is on disk.

use crate::edit::{EditCodecError, TransactionEdit};
use crate::wire::{self, Reader};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Magic prefix of every edit log segment.
pub const LOG_MAGIC: [u8; 4] = *b"KTXL";

/// Frame tag: a sequenced edit record.
const REC_EDIT: u8 = 0x01;
/// Frame tag: a commit marker announcing the size of the next group.
const REC_COMMIT_MARKER: u8 = 0x02;

/// Errors from writing or reading edit log segments.
#[derive(Debug, Error)]
pub enum LogError {
    /// Underlying file I/O failed.
    #[error("log io error: {0}")]
    Io(#[from] io::Error),

    /// The file does not start with the log magic.
    #[error("not an edit log: bad magic")]
    BadMagic,

    /// The version byte names a format this reader does not know.
    #[error("unsupported edit log version {0}")]
    UnsupportedVersion(u8),

    /// Append or sync on a closed segment.
    #[error("edit log segment {0} is closed")]
    Closed(String),

    /// Edit payload failed to decode after its CRC validated — a format
    /// bug rather than a torn write.
    #[error(transparent)]
    Codec(#[from] EditCodecError),
}

impl From<LogError> for keystone_core::TxError {
    fn from(e: LogError) -> Self {
        keystone_core::TxError::log_failure_with_source("edit log operation failed", e)
    }
}

// ============================================================================
// Format and sync policy
// ============================================================================

/// On-disk format version of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditLogFormat {
    /// Legacy: bare edit frames, truncate on first error.
    V1,
    /// Current: commit-marker group framing.
    V2,
}

impl EditLogFormat {
    pub fn version_byte(self) -> u8 {
        match self {
            EditLogFormat::V1 => 1,
            EditLogFormat::V2 => 2,
        }
    }

    pub fn from_version_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(EditLogFormat::V1),
            2 => Some(EditLogFormat::V2),
            _ => None,
        }
    }
}

/// When the writer forces data to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync after every group. Required for the synchronous durability
    /// contract of the coordinator.
    Always,
    /// fsync when either threshold is reached. Trades a bounded window of
    /// committed-but-volatile edits for throughput; only suitable for
    /// followers and tooling.
    Batched {
        /// Unsynced edit count that forces an fsync.
        batch_edits: usize,
        /// Elapsed time since the last fsync that forces one.
        interval: Duration,
    },
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Always
    }
}

// ============================================================================
// TransactionLog trait
// ============================================================================

/// One open edit log segment accepting appended groups.
pub trait TransactionLog: Send {
    /// Display name for logging and errors.
    fn name(&self) -> String;

    /// Logical timestamp of this segment (its snapshot epoch).
    fn timestamp(&self) -> i64;

    /// Append one group of edits atomically with respect to replay.
    fn append(&mut self, edits: &[TransactionEdit]) -> Result<(), LogError>;

    /// Force everything appended so far to durable storage.
    fn sync(&mut self) -> Result<(), LogError>;

    /// Flush, sync and close the segment. Further appends fail.
    fn close(&mut self) -> Result<(), LogError>;
}

// ============================================================================
// Writer
// ============================================================================

/// File-backed edit log writer.
pub struct EditLogWriter {
    path: PathBuf,
    timestamp: i64,
    writer: Option<BufWriter<File>>,
    format: EditLogFormat,
    policy: SyncPolicy,
    next_seq: u64,
    edits_since_sync: usize,
    last_sync: Instant,
}

impl EditLogWriter {
    /// Create a new segment at `path`, writing the header immediately.
    pub fn create(
        path: impl Into<PathBuf>,
        timestamp: i64,
        format: EditLogFormat,
        policy: SyncPolicy,
    ) -> Result<Self, LogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&LOG_MAGIC)?;
        writer.write_all(&[format.version_byte()])?;
        writer.flush()?;
        debug!(path = %path.display(), version = format.version_byte(), "opened edit log segment");
        Ok(EditLogWriter {
            path,
            timestamp,
            writer: Some(writer),
            format,
            policy,
            next_seq: 0,
            edits_since_sync: 0,
            last_sync: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn frame(content: &[u8]) -> Vec<u8> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(content);
        let crc = hasher.finalize();

        let mut buf = Vec::with_capacity(4 + content.len() + 4);
        wire::put_u32(&mut buf, (content.len() + 4) as u32);
        buf.extend_from_slice(content);
        wire::put_u32(&mut buf, crc);
        buf
    }

    fn marker_frame(count: u32) -> Vec<u8> {
        let mut content = Vec::with_capacity(5);
        wire::put_u8(&mut content, REC_COMMIT_MARKER);
        wire::put_u32(&mut content, count);
        Self::frame(&content)
    }

    fn edit_frame(seq: u64, edit: &TransactionEdit) -> Vec<u8> {
        let mut content = Vec::with_capacity(16);
        wire::put_u8(&mut content, REC_EDIT);
        wire::put_u64(&mut content, seq);
        edit.encode(&mut content);
        Self::frame(&content)
    }

    fn maybe_sync(&mut self, appended: usize) -> Result<(), LogError> {
        match self.policy {
            SyncPolicy::Always => self.sync_inner(),
            SyncPolicy::Batched {
                batch_edits,
                interval,
            } => {
                self.edits_since_sync += appended;
                if self.edits_since_sync >= batch_edits || self.last_sync.elapsed() >= interval {
                    self.sync_inner()
                } else {
                    Ok(())
                }
            }
        }
    }

    fn sync_inner(&mut self) -> Result<(), LogError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| LogError::Closed(self.path.display().to_string()))?;
        writer.flush()?;
        writer.get_mut().sync_all()?;
        self.edits_since_sync = 0;
        self.last_sync = Instant::now();
        Ok(())
    }
}

impl TransactionLog for EditLogWriter {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn append(&mut self, edits: &[TransactionEdit]) -> Result<(), LogError> {
        if edits.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(64 * edits.len());
        if self.format == EditLogFormat::V2 {
            buf.extend_from_slice(&Self::marker_frame(edits.len() as u32));
        }
        for edit in edits {
            buf.extend_from_slice(&Self::edit_frame(self.next_seq, edit));
            self.next_seq += 1;
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| LogError::Closed(self.path.display().to_string()))?;
        writer.write_all(&buf)?;
        writer.flush()?;
        trace!(
            path = %self.path.display(),
            group = edits.len(),
            next_seq = self.next_seq,
            "appended edit group"
        );
        self.maybe_sync(edits.len())
    }

    fn sync(&mut self) -> Result<(), LogError> {
        self.sync_inner()
    }

    fn close(&mut self) -> Result<(), LogError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_mut().sync_all()?;
            debug!(path = %self.path.display(), "closed edit log segment");
        }
        Ok(())
    }
}

impl Drop for EditLogWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Crash-tolerant reader over complete segment bytes.
pub struct EditLogReader;

/// One intact frame: its tag and content after the tag.
struct Frame<'a> {
    tag: u8,
    body: &'a [u8],
}

impl EditLogReader {
    /// Read every durable edit from a segment file.
    pub fn read_file(path: impl AsRef<Path>) -> Result<Vec<TransactionEdit>, LogError> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::read_bytes(&bytes)
    }

    /// Read every durable edit from raw segment bytes.
    pub fn read_bytes(bytes: &[u8]) -> Result<Vec<TransactionEdit>, LogError> {
        if bytes.len() < 5 {
            return Err(LogError::BadMagic);
        }
        if bytes[..4] != LOG_MAGIC {
            return Err(LogError::BadMagic);
        }
        let format = EditLogFormat::from_version_byte(bytes[4])
            .ok_or(LogError::UnsupportedVersion(bytes[4]))?;
        let mut r = Reader::new(&bytes[5..]);
        match format {
            EditLogFormat::V1 => Ok(Self::read_v1(&mut r)),
            EditLogFormat::V2 => Ok(Self::read_v2(&mut r)),
        }
    }

    /// Next intact frame, or `None` at clean EOF *and* on any torn or
    /// corrupt data — from the reader's point of view both mean "end of
    /// durable records".
    fn next_frame<'a>(r: &mut Reader<'a>) -> Option<Frame<'a>> {
        if r.is_empty() {
            return None;
        }
        let offset = r.position();
        let total_len = r.read_u32().ok()? as usize;
        if total_len < 5 || total_len > wire::MAX_LEN_PREFIX || r.remaining() < total_len {
            warn!(offset, total_len, "torn or corrupt frame length, stopping");
            return None;
        }
        let content_len = total_len - 4;
        let content = r.read_slice(content_len).ok()?;
        let crc_expected = r.read_u32().ok()?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(content);
        if hasher.finalize() != crc_expected {
            warn!(offset, "frame checksum mismatch, stopping");
            return None;
        }
        Some(Frame {
            tag: content[0],
            body: &content[1..],
        })
    }

    fn read_v1(r: &mut Reader<'_>) -> Vec<TransactionEdit> {
        let mut edits = Vec::new();
        while let Some(frame) = Self::next_frame(r) {
            if frame.tag != REC_EDIT {
                warn!(tag = frame.tag, "unexpected frame tag in v1 log, stopping");
                break;
            }
            match Self::decode_edit_body(frame.body) {
                Some(edit) => edits.push(edit),
                None => break,
            }
        }
        edits
    }

    fn read_v2(r: &mut Reader<'_>) -> Vec<TransactionEdit> {
        let mut edits = Vec::new();
        loop {
            let marker = match Self::next_frame(r) {
                None => break,
                Some(f) => f,
            };
            if marker.tag != REC_COMMIT_MARKER {
                warn!(tag = marker.tag, "expected commit marker, stopping");
                break;
            }
            let mut body = Reader::new(marker.body);
            let count = match body.read_u32() {
                Ok(c) => c as usize,
                Err(_) => break,
            };

            let mut group = Vec::with_capacity(count);
            let mut complete = true;
            for _ in 0..count {
                let frame = match Self::next_frame(r) {
                    None => {
                        complete = false;
                        break;
                    }
                    Some(f) => f,
                };
                if frame.tag != REC_EDIT {
                    complete = false;
                    break;
                }
                match Self::decode_edit_body(frame.body) {
                    Some(edit) => group.push(edit),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }

            if complete {
                edits.extend(group);
            } else {
                warn!(
                    expected = count,
                    read = group.len(),
                    "discarding torn trailing group"
                );
                break;
            }
        }
        edits
    }

    fn decode_edit_body(body: &[u8]) -> Option<TransactionEdit> {
        let mut r = Reader::new(body);
        let _seq = r.read_u64().ok()?;
        match TransactionEdit::decode(&mut r) {
            Ok(edit) => Some(edit),
            Err(e) => {
                warn!(error = %e, "undecodable edit after valid checksum, stopping");
                None
            }
        }
    }
}

// ============================================================================
// In-memory segment (tests, ephemeral coordinators)
// ============================================================================

/// Edit log segment that keeps decoded edits in memory, shared with the
/// in-memory storage that created it.
pub struct InMemoryTransactionLog {
    pub(crate) timestamp: i64,
    pub(crate) edits: std::sync::Arc<parking_lot::Mutex<Vec<TransactionEdit>>>,
    closed: bool,
}

impl InMemoryTransactionLog {
    pub fn new(
        timestamp: i64,
        edits: std::sync::Arc<parking_lot::Mutex<Vec<TransactionEdit>>>,
    ) -> Self {
        InMemoryTransactionLog {
            timestamp,
            edits,
            closed: false,
        }
    }
}

impl TransactionLog for InMemoryTransactionLog {
    fn name(&self) -> String {
        format!("txlog.{}(mem)", self.timestamp)
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn append(&mut self, edits: &[TransactionEdit]) -> Result<(), LogError> {
        if self.closed {
            return Err(LogError::Closed(self.name()));
        }
        self.edits.lock().extend_from_slice(edits);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), LogError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), LogError> {
        self.closed = true;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn edit(n: u64) -> TransactionEdit {
        TransactionEdit::Aborted { tx_id: n }
    }

    fn write_groups(path: &Path, groups: &[&[TransactionEdit]]) {
        let mut writer =
            EditLogWriter::create(path, 1, EditLogFormat::V2, SyncPolicy::Always).unwrap();
        for group in groups {
            writer.append(group).unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn write_and_read_groups() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txlog.1");
        let g1 = [edit(1), edit(2), edit(3)];
        let g2 = [edit(4)];
        write_groups(&path, &[&g1, &g2]);

        let edits = EditLogReader::read_file(&path).unwrap();
        assert_eq!(edits.len(), 4);
        assert_eq!(edits[0], edit(1));
        assert_eq!(edits[3], edit(4));
    }

    #[test]
    fn empty_group_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txlog.1");
        let mut writer =
            EditLogWriter::create(&path, 1, EditLogFormat::V2, SyncPolicy::Always).unwrap();
        writer.append(&[]).unwrap();
        writer.close().unwrap();
        assert_eq!(EditLogReader::read_file(&path).unwrap().len(), 0);
    }

    #[test]
    fn torn_final_record_discards_whole_group() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txlog.1");
        let g1 = [edit(1), edit(2), edit(3)];
        let g2 = [edit(4), edit(5), edit(6)];
        write_groups(&path, &[&g1, &g2]);

        // Corrupt the length prefix of the final record.
        let mut bytes = std::fs::read(&path).unwrap();
        let last_frame_len = EditLogWriter::edit_frame(5, &edit(6)).len();
        let frame_start = bytes.len() - last_frame_len;
        bytes[frame_start] = 0xFF;
        bytes[frame_start + 1] = 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let edits = EditLogReader::read_file(&path).unwrap();
        assert_eq!(edits, vec![edit(1), edit(2), edit(3)]);
    }

    #[test]
    fn truncated_tail_discards_whole_group() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txlog.1");
        let g1 = [edit(1), edit(2)];
        let g2 = [edit(3), edit(4)];
        write_groups(&path, &[&g1, &g2]);

        // Chop the file mid-way through the last record.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let edits = EditLogReader::read_file(&path).unwrap();
        assert_eq!(edits, vec![edit(1), edit(2)]);
    }

    #[test]
    fn corrupted_payload_fails_checksum_and_stops() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txlog.1");
        write_groups(&path, &[&[edit(1)], &[edit(2)]]);

        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a payload byte in the second group (well past header+group 1).
        let n = bytes.len();
        bytes[n - 6] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let edits = EditLogReader::read_file(&path).unwrap();
        assert_eq!(edits, vec![edit(1)]);
    }

    #[test]
    fn v1_reads_until_first_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txlog.1");
        let mut writer =
            EditLogWriter::create(&path, 1, EditLogFormat::V1, SyncPolicy::Always).unwrap();
        writer.append(&[edit(1), edit(2), edit(3)]).unwrap();
        writer.close().unwrap();

        // Intact v1 log: all records, no markers involved.
        assert_eq!(EditLogReader::read_file(&path).unwrap().len(), 3);

        // Truncate into the last record: v1 keeps everything before it.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
        assert_eq!(
            EditLogReader::read_file(&path).unwrap(),
            vec![edit(1), edit(2)]
        );
    }

    #[test]
    fn bad_magic_is_a_hard_error() {
        assert!(matches!(
            EditLogReader::read_bytes(b"NOPE\x02rest"),
            Err(LogError::BadMagic)
        ));
        assert!(matches!(
            EditLogReader::read_bytes(b"KTXL\x09"),
            Err(LogError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn closed_segment_rejects_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txlog.1");
        let mut writer =
            EditLogWriter::create(&path, 1, EditLogFormat::V2, SyncPolicy::Always).unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.append(&[edit(1)]),
            Err(LogError::Closed(_))
        ));
    }

    #[test]
    fn batched_policy_syncs_on_batch_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txlog.1");
        let mut writer = EditLogWriter::create(
            &path,
            1,
            EditLogFormat::V2,
            SyncPolicy::Batched {
                batch_edits: 2,
                interval: Duration::from_secs(3600),
            },
        )
        .unwrap();
        writer.append(&[edit(1)]).unwrap();
        writer.append(&[edit(2)]).unwrap();
        writer.append(&[edit(3)]).unwrap();
        writer.close().unwrap();
        assert_eq!(EditLogReader::read_file(&path).unwrap().len(), 3);
    }

    #[test]
    fn in_memory_log_shares_edits() {
        let shared = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut log = InMemoryTransactionLog::new(7, shared.clone());
        log.append(&[edit(1), edit(2)]).unwrap();
        assert_eq!(shared.lock().len(), 2);
        log.close().unwrap();
        assert!(log.append(&[edit(3)]).is_err());
    }
}
