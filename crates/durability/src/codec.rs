//! Versioned snapshot codecs and the provider registry.
//!
//! Snapshot bytes are `[magic "KTXS" (4)][version (1)][body]`. The body is
//! written by the codec matching the version byte:
//!
//! ```text
//! -- visibility prefix --
//! timestamp(8) read_pointer(8) write_pointer(8)
//! invalid:     count(4) [tx_id(8)]*
//! in_progress: count(4) [tx_id(8) visibility_upper_bound(8) expiration(8)
//!                        {v2: type(1) checkpoint_count(4) [tx_id(8)]*}]*
//! -- tail --
//! committing:  count(4) [tx_id(8) change_count(4) [len(4) bytes]*]*
//! committed:   count(4) [tx_id(8) change_count(4) [len(4) bytes]*]*
//! ```
//!
//! V1 is the legacy format: no in-progress type byte and no checkpoint
//! pointers. Decoding it yields entries with `tx_type = None`; the manager
//! reconstructs the types on load. Producers always write the highest
//! registered version; readers accept any registered one.
//!
//! `decode_visibility` parses only the prefix and never touches the tail,
//! so a follower can recover visibility from a snapshot whose change-set
//! bytes are torn or corrupt.

use crate::edit::{decode_changes, encode_changes};
use crate::snapshot::{TransactionSnapshot, TransactionVisibilityState};
use crate::wire::{self, Reader, WireError};
use keystone_core::{ChangeId, InProgressTx, TransactionType, TxId};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

/// Magic prefix of every snapshot.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"KTXS";

/// Errors from encoding or decoding snapshots.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The stream does not start with the snapshot magic.
    #[error("not a snapshot: bad magic")]
    BadMagic,

    /// No codec registered for the version byte found in the stream.
    #[error("no codec registered for snapshot version {0}")]
    UnknownVersion(u8),

    /// Provider configured with an unknown version number.
    #[error("cannot configure snapshot codec version {0}")]
    UnsupportedVersion(u8),

    /// Provider configured with no versions at all.
    #[error("no snapshot codec versions configured")]
    NoCodecs,

    /// Unknown transaction type byte in an in-progress entry.
    #[error("unknown transaction type byte 0x{0:02x}")]
    UnknownTransactionType(u8),

    /// Truncated or corrupt snapshot data.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Underlying file I/O failed.
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SnapshotError> for keystone_core::TxError {
    fn from(e: SnapshotError) -> Self {
        keystone_core::TxError::snapshot_failure_with_source("snapshot operation failed", e)
    }
}

// ============================================================================
// Codec trait
// ============================================================================

/// One snapshot body format, identified by its version byte.
pub trait SnapshotCodec: Send + Sync {
    /// Version byte this codec owns.
    fn version(&self) -> u8;

    /// Append the encoded body (without magic/version header) to `out`.
    fn encode(&self, snapshot: &TransactionSnapshot, out: &mut Vec<u8>);

    /// Decode a full snapshot from body bytes.
    fn decode(&self, body: &[u8]) -> Result<TransactionSnapshot, SnapshotError>;

    /// Decode only the visibility prefix, tolerating a corrupt tail.
    fn decode_visibility(&self, body: &[u8])
        -> Result<TransactionVisibilityState, SnapshotError>;
}

// ----------------------------------------------------------------------------
// Shared pieces
// ----------------------------------------------------------------------------

fn encode_pointers(snapshot: &TransactionSnapshot, out: &mut Vec<u8>) {
    wire::put_i64(out, snapshot.timestamp);
    wire::put_u64(out, snapshot.read_pointer);
    wire::put_u64(out, snapshot.write_pointer);
    wire::put_u32(out, snapshot.invalid.len() as u32);
    for id in &snapshot.invalid {
        wire::put_u64(out, *id);
    }
}

fn encode_change_set_map(map: &BTreeMap<TxId, BTreeSet<ChangeId>>, out: &mut Vec<u8>) {
    wire::put_u32(out, map.len() as u32);
    for (tx_id, changes) in map {
        wire::put_u64(out, *tx_id);
        encode_changes(out, changes);
    }
}

fn decode_change_set_map(
    r: &mut Reader<'_>,
) -> Result<BTreeMap<TxId, BTreeSet<ChangeId>>, SnapshotError> {
    let count = r.read_count(12)?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let tx_id = r.read_u64()?;
        map.insert(tx_id, decode_changes(r)?);
    }
    Ok(map)
}

struct VisibilityPrefix {
    timestamp: i64,
    read_pointer: TxId,
    write_pointer: TxId,
    invalid: Vec<TxId>,
}

fn decode_pointers(r: &mut Reader<'_>) -> Result<VisibilityPrefix, SnapshotError> {
    let timestamp = r.read_i64()?;
    let read_pointer = r.read_u64()?;
    let write_pointer = r.read_u64()?;
    let count = r.read_count(8)?;
    let mut invalid = Vec::with_capacity(count);
    for _ in 0..count {
        invalid.push(r.read_u64()?);
    }
    Ok(VisibilityPrefix {
        timestamp,
        read_pointer,
        write_pointer,
        invalid,
    })
}

// ============================================================================
// V1 — legacy, no in-progress type information
// ============================================================================

/// Legacy codec. In-progress entries carry no type byte and no checkpoint
/// pointers; loading requires the manager's type fix-up.
pub struct SnapshotCodecV1;

impl SnapshotCodec for SnapshotCodecV1 {
    fn version(&self) -> u8 {
        1
    }

    fn encode(&self, snapshot: &TransactionSnapshot, out: &mut Vec<u8>) {
        encode_pointers(snapshot, out);
        wire::put_u32(out, snapshot.in_progress.len() as u32);
        for (tx_id, entry) in &snapshot.in_progress {
            wire::put_u64(out, *tx_id);
            wire::put_u64(out, entry.visibility_upper_bound);
            wire::put_i64(out, entry.expiration);
        }
        encode_change_set_map(&snapshot.committing_change_sets, out);
        encode_change_set_map(&snapshot.committed_change_sets, out);
    }

    fn decode(&self, body: &[u8]) -> Result<TransactionSnapshot, SnapshotError> {
        let mut r = Reader::new(body);
        let vis = self.decode_visibility_inner(&mut r)?;
        let committing_change_sets = decode_change_set_map(&mut r)?;
        let committed_change_sets = decode_change_set_map(&mut r)?;
        Ok(TransactionSnapshot {
            timestamp: vis.timestamp,
            read_pointer: vis.read_pointer,
            write_pointer: vis.write_pointer,
            invalid: vis.invalid,
            in_progress: vis.in_progress,
            committing_change_sets,
            committed_change_sets,
        })
    }

    fn decode_visibility(
        &self,
        body: &[u8],
    ) -> Result<TransactionVisibilityState, SnapshotError> {
        let mut r = Reader::new(body);
        self.decode_visibility_inner(&mut r)
    }
}

impl SnapshotCodecV1 {
    fn decode_visibility_inner(
        &self,
        r: &mut Reader<'_>,
    ) -> Result<TransactionVisibilityState, SnapshotError> {
        let prefix = decode_pointers(r)?;
        let count = r.read_count(24)?;
        let mut in_progress = BTreeMap::new();
        for _ in 0..count {
            let tx_id = r.read_u64()?;
            let visibility_upper_bound = r.read_u64()?;
            let expiration = r.read_i64()?;
            in_progress.insert(
                tx_id,
                InProgressTx::without_type(visibility_upper_bound, expiration),
            );
        }
        Ok(TransactionVisibilityState {
            timestamp: prefix.timestamp,
            read_pointer: prefix.read_pointer,
            write_pointer: prefix.write_pointer,
            invalid: prefix.invalid,
            in_progress,
        })
    }
}

// ============================================================================
// V2 — current format
// ============================================================================

/// Current codec: in-progress entries carry their type byte and checkpoint
/// write pointers.
pub struct SnapshotCodecV2;

impl SnapshotCodec for SnapshotCodecV2 {
    fn version(&self) -> u8 {
        2
    }

    fn encode(&self, snapshot: &TransactionSnapshot, out: &mut Vec<u8>) {
        encode_pointers(snapshot, out);
        wire::put_u32(out, snapshot.in_progress.len() as u32);
        for (tx_id, entry) in &snapshot.in_progress {
            wire::put_u64(out, *tx_id);
            wire::put_u64(out, entry.visibility_upper_bound);
            wire::put_i64(out, entry.expiration);
            // Entries should always be typed by the time they are written;
            // 0 marks the (never expected) untyped case.
            wire::put_u8(out, entry.tx_type.map_or(0, TransactionType::to_byte));
            wire::put_u32(out, entry.checkpoint_write_pointers.len() as u32);
            for cp in &entry.checkpoint_write_pointers {
                wire::put_u64(out, *cp);
            }
        }
        encode_change_set_map(&snapshot.committing_change_sets, out);
        encode_change_set_map(&snapshot.committed_change_sets, out);
    }

    fn decode(&self, body: &[u8]) -> Result<TransactionSnapshot, SnapshotError> {
        let mut r = Reader::new(body);
        let vis = self.decode_visibility_inner(&mut r)?;
        let committing_change_sets = decode_change_set_map(&mut r)?;
        let committed_change_sets = decode_change_set_map(&mut r)?;
        Ok(TransactionSnapshot {
            timestamp: vis.timestamp,
            read_pointer: vis.read_pointer,
            write_pointer: vis.write_pointer,
            invalid: vis.invalid,
            in_progress: vis.in_progress,
            committing_change_sets,
            committed_change_sets,
        })
    }

    fn decode_visibility(
        &self,
        body: &[u8],
    ) -> Result<TransactionVisibilityState, SnapshotError> {
        let mut r = Reader::new(body);
        self.decode_visibility_inner(&mut r)
    }
}

impl SnapshotCodecV2 {
    fn decode_visibility_inner(
        &self,
        r: &mut Reader<'_>,
    ) -> Result<TransactionVisibilityState, SnapshotError> {
        let prefix = decode_pointers(r)?;
        let count = r.read_count(29)?;
        let mut in_progress = BTreeMap::new();
        for _ in 0..count {
            let tx_id = r.read_u64()?;
            let visibility_upper_bound = r.read_u64()?;
            let expiration = r.read_i64()?;
            let raw_type = r.read_u8()?;
            let tx_type = match raw_type {
                0 => None,
                b => Some(
                    TransactionType::from_byte(b)
                        .ok_or(SnapshotError::UnknownTransactionType(b))?,
                ),
            };
            let cp_count = r.read_count(8)?;
            let mut checkpoint_write_pointers = Vec::with_capacity(cp_count);
            for _ in 0..cp_count {
                checkpoint_write_pointers.push(r.read_u64()?);
            }
            in_progress.insert(
                tx_id,
                InProgressTx {
                    visibility_upper_bound,
                    expiration,
                    tx_type,
                    checkpoint_write_pointers,
                },
            );
        }
        Ok(TransactionVisibilityState {
            timestamp: prefix.timestamp,
            read_pointer: prefix.read_pointer,
            write_pointer: prefix.write_pointer,
            invalid: prefix.invalid,
            in_progress,
        })
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Registry of codecs keyed by version byte. Encoding uses the highest
/// registered version; decoding selects by the version byte read from the
/// stream.
pub struct SnapshotCodecProvider {
    codecs: BTreeMap<u8, Box<dyn SnapshotCodec>>,
}

impl SnapshotCodecProvider {
    /// Provider with every built-in codec registered (V1 and V2).
    pub fn new_default() -> Self {
        let mut provider = SnapshotCodecProvider {
            codecs: BTreeMap::new(),
        };
        provider.register(Box::new(SnapshotCodecV1));
        provider.register(Box::new(SnapshotCodecV2));
        provider
    }

    /// Provider restricted to the given versions, e.g. from configuration.
    pub fn from_versions(versions: &[u8]) -> Result<Self, SnapshotError> {
        if versions.is_empty() {
            return Err(SnapshotError::NoCodecs);
        }
        let mut provider = SnapshotCodecProvider {
            codecs: BTreeMap::new(),
        };
        for &v in versions {
            let codec: Box<dyn SnapshotCodec> = match v {
                1 => Box::new(SnapshotCodecV1),
                2 => Box::new(SnapshotCodecV2),
                other => return Err(SnapshotError::UnsupportedVersion(other)),
            };
            provider.register(codec);
        }
        Ok(provider)
    }

    /// Register a codec, replacing any codec with the same version.
    pub fn register(&mut self, codec: Box<dyn SnapshotCodec>) {
        self.codecs.insert(codec.version(), codec);
    }

    fn write_codec(&self) -> &dyn SnapshotCodec {
        self.codecs
            .values()
            .next_back()
            .expect("provider always holds at least one codec")
            .as_ref()
    }

    /// Encode with the highest registered version, header included.
    pub fn encode(&self, snapshot: &TransactionSnapshot) -> Vec<u8> {
        let codec = self.write_codec();
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.push(codec.version());
        codec.encode(snapshot, &mut out);
        debug!(
            version = codec.version(),
            bytes = out.len(),
            "encoded snapshot"
        );
        out
    }

    fn select(&self, bytes: &[u8]) -> Result<(&dyn SnapshotCodec, usize), SnapshotError> {
        if bytes.len() < 5 || bytes[..4] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let version = bytes[4];
        let codec = self
            .codecs
            .get(&version)
            .ok_or(SnapshotError::UnknownVersion(version))?;
        Ok((codec.as_ref(), 5))
    }

    /// Decode a full snapshot, selecting the codec by version byte.
    pub fn decode(&self, bytes: &[u8]) -> Result<TransactionSnapshot, SnapshotError> {
        let (codec, offset) = self.select(bytes)?;
        codec.decode(&bytes[offset..])
    }

    /// Decode only the visibility prefix; tail corruption is ignored.
    pub fn decode_visibility(
        &self,
        bytes: &[u8],
    ) -> Result<TransactionVisibilityState, SnapshotError> {
        let (codec, offset) = self.select(bytes)?;
        codec.decode_visibility(&bytes[offset..])
    }
}

impl Default for SnapshotCodecProvider {
    fn default() -> Self {
        Self::new_default()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::NO_EXPIRATION;

    fn sample_snapshot() -> TransactionSnapshot {
        let mut snapshot = TransactionSnapshot::empty();
        snapshot.timestamp = 1_700_000_000_000;
        snapshot.read_pointer = 96;
        snapshot.write_pointer = 100;
        snapshot.invalid = vec![95];
        snapshot.in_progress.insert(
            97,
            InProgressTx::new(96, NO_EXPIRATION, TransactionType::Long),
        );
        snapshot.in_progress.insert(
            99,
            InProgressTx::new(96, 1_700_000_030_000, TransactionType::Short),
        );
        snapshot.committing_change_sets.insert(
            99,
            [ChangeId::new(b"r3".to_vec()), ChangeId::new(b"r4".to_vec())]
                .into_iter()
                .collect(),
        );
        snapshot.committed_change_sets.insert(
            98,
            [ChangeId::new(b"r1".to_vec()), ChangeId::new(b"r2".to_vec())]
                .into_iter()
                .collect(),
        );
        snapshot
    }

    #[test]
    fn v2_round_trips_exactly() {
        let provider = SnapshotCodecProvider::new_default();
        let snapshot = sample_snapshot();
        let bytes = provider.encode(&snapshot);
        assert_eq!(bytes[4], 2, "writes with highest registered version");
        assert_eq!(provider.decode(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn visibility_matches_projection() {
        let provider = SnapshotCodecProvider::new_default();
        let snapshot = sample_snapshot();
        let bytes = provider.encode(&snapshot);
        let vis = provider.decode_visibility(&bytes).unwrap();
        assert_eq!(vis, snapshot.visibility_state());
    }

    #[test]
    fn visibility_survives_corrupt_tail() {
        let provider = SnapshotCodecProvider::new_default();
        let snapshot = sample_snapshot();
        let mut bytes = provider.encode(&snapshot);

        // Stomp on the last byte (inside the committed change-sets).
        let n = bytes.len();
        bytes[n - 1] = b'a';
        bytes.truncate(n - 1);

        assert!(provider.decode(&bytes).is_err());
        let vis = provider.decode_visibility(&bytes).unwrap();
        assert_eq!(vis, snapshot.visibility_state());
    }

    #[test]
    fn v1_drops_type_information() {
        let provider = SnapshotCodecProvider::from_versions(&[1]).unwrap();
        let snapshot = sample_snapshot();
        let bytes = provider.encode(&snapshot);
        assert_eq!(bytes[4], 1);

        let decoded = provider.decode(&bytes).unwrap();
        assert_eq!(decoded.read_pointer, snapshot.read_pointer);
        assert_eq!(decoded.write_pointer, snapshot.write_pointer);
        assert_eq!(decoded.invalid, snapshot.invalid);
        assert_eq!(
            decoded.committing_change_sets,
            snapshot.committing_change_sets
        );
        assert_eq!(
            decoded.committed_change_sets,
            snapshot.committed_change_sets
        );
        // Types are gone until the manager's fix-up runs.
        assert_ne!(decoded.in_progress, snapshot.in_progress);
        assert!(decoded.in_progress.values().all(|e| e.tx_type.is_none()));
    }

    #[test]
    fn newer_provider_reads_v1_bytes() {
        let legacy = SnapshotCodecProvider::from_versions(&[1]).unwrap();
        let current = SnapshotCodecProvider::new_default();
        let snapshot = sample_snapshot();
        let bytes = legacy.encode(&snapshot);
        let decoded = current.decode(&bytes).unwrap();
        assert_eq!(decoded.write_pointer, snapshot.write_pointer);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let provider = SnapshotCodecProvider::from_versions(&[2]).unwrap();
        let mut bytes = provider.encode(&sample_snapshot());
        bytes[4] = 7;
        assert!(matches!(
            provider.decode(&bytes),
            Err(SnapshotError::UnknownVersion(7))
        ));
        assert!(matches!(
            SnapshotCodecProvider::from_versions(&[9]),
            Err(SnapshotError::UnsupportedVersion(9))
        ));
        assert!(matches!(
            SnapshotCodecProvider::from_versions(&[]),
            Err(SnapshotError::NoCodecs)
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let provider = SnapshotCodecProvider::new_default();
        assert!(matches!(
            provider.decode(b"WRONG..."),
            Err(SnapshotError::BadMagic)
        ));
    }
}
