//! Transaction identifiers, type codes and the client-facing visibility view.
//!
//! Transaction ids are 64-bit integers derived from wall-clock time:
//! `currentTimeMillis * MAX_TX_PER_MS + sequence`. The timestamp prefix makes
//! ids globally ordered across restarts, and lets time-based invalid-list
//! truncation recover the start time of a transaction from its id alone.
//!
//! The [`Transaction`] struct is the immutable view handed to clients at
//! `start` (and updated at `checkpoint`). It captures everything a reader
//! needs to apply snapshot-isolation visibility without talking to the
//! coordinator again.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A transaction identifier / version pointer.
///
/// Ids double as version numbers: a write stamped with id `v` belongs to
/// the history position `v`.
pub type TxId = u64;

/// Default number of transaction ids per millisecond of wall-clock time.
///
/// This constant is the id-density factor: `id / MAX_TX_PER_MS` recovers the
/// start timestamp in milliseconds. It must be stable across runs of the
/// same coordinator, otherwise persisted ids stop decoding to sane times.
pub const MAX_TX_PER_MS: u64 = 1_000_000;

/// Expiration value for transactions that never expire (LONG).
pub const NO_EXPIRATION: i64 = -1;

/// Sentinel id meaning "no such transaction in progress".
///
/// Used for `first_short_in_progress` when no SHORT transaction is running;
/// every real id compares below it, so range scans stay branch-free.
pub const NO_TX_IN_PROGRESS: TxId = TxId::MAX;

// ============================================================================
// Transaction type codes
// ============================================================================

/// Category of an in-progress transaction. The categories differ only in
/// expiration policy: SHORT expires and is invalidated by the cleanup sweep,
/// LONG never expires, CHECKPOINT entries inherit their parent's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    /// Regular transaction with a bounded timeout.
    Short,
    /// Long-running transaction, immune to the expiration sweep.
    Long,
    /// Additional write pointer issued to an existing transaction.
    Checkpoint,
}

impl TransactionType {
    /// Serialize to the stable single-byte code used in logs and snapshots.
    ///
    /// The mapping is explicit (not an enum ordinal) so that reordering
    /// variants can never silently change the durable format.
    pub fn to_byte(self) -> u8 {
        match self {
            TransactionType::Short => 1,
            TransactionType::Long => 2,
            TransactionType::Checkpoint => 3,
        }
    }

    /// Decode the stable single-byte code.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(TransactionType::Short),
            2 => Some(TransactionType::Long),
            3 => Some(TransactionType::Checkpoint),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Short => write!(f, "SHORT"),
            TransactionType::Long => write!(f, "LONG"),
            TransactionType::Checkpoint => write!(f, "CHECKPOINT"),
        }
    }
}

// ============================================================================
// Change ids
// ============================================================================

/// Opaque identifier for a row/key touched by a transaction.
///
/// Equality and ordering are on the raw bytes; the coordinator never
/// interprets the contents. Participants are free to encode table+row,
/// hashed keys, or anything else that identifies a conflict unit.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeId(Vec<u8>);

impl ChangeId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        ChangeId(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for ChangeId {
    fn from(bytes: &[u8]) -> Self {
        ChangeId(bytes.to_vec())
    }
}

impl From<Vec<u8>> for ChangeId {
    fn from(bytes: Vec<u8>) -> Self {
        ChangeId(bytes)
    }
}

impl fmt::Debug for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeId(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// ============================================================================
// In-progress bookkeeping
// ============================================================================

/// Manager-internal record for one in-progress transaction.
///
/// `tx_type` is `None` only transiently, for entries decoded from legacy
/// snapshots that did not serialize the type; the recovery fix-up
/// reconstructs it before the entry is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressTx {
    /// The read pointer captured when this transaction started. Committed
    /// transactions above this bound are the ones that can conflict.
    pub visibility_upper_bound: TxId,
    /// Wall-clock millis at which the cleanup sweep may invalidate this
    /// transaction, or [`NO_EXPIRATION`] for LONG.
    pub expiration: i64,
    /// SHORT / LONG / CHECKPOINT, or `None` for un-fixed legacy entries.
    pub tx_type: Option<TransactionType>,
    /// Prior write pointers issued to this logical transaction.
    pub checkpoint_write_pointers: Vec<TxId>,
}

impl InProgressTx {
    pub fn new(visibility_upper_bound: TxId, expiration: i64, tx_type: TransactionType) -> Self {
        InProgressTx {
            visibility_upper_bound,
            expiration,
            tx_type: Some(tx_type),
            checkpoint_write_pointers: Vec::new(),
        }
    }

    /// Legacy constructor for entries decoded without a type byte.
    pub fn without_type(visibility_upper_bound: TxId, expiration: i64) -> Self {
        InProgressTx {
            visibility_upper_bound,
            expiration,
            tx_type: None,
            checkpoint_write_pointers: Vec::new(),
        }
    }

    pub fn is_long(&self) -> bool {
        self.tx_type == Some(TransactionType::Long)
    }

    pub fn is_checkpoint(&self) -> bool {
        self.tx_type == Some(TransactionType::Checkpoint)
    }

    /// Whether the cleanup sweep may invalidate this entry at time `now`.
    /// LONG entries never expire; entries without a type are left alone
    /// until the fix-up has run.
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        self.expiration >= 0 && self.expiration < now_millis && !self.is_long()
    }
}

// ============================================================================
// Client-facing transaction view
// ============================================================================

/// Immutable snapshot of visibility handed to a client at `start` (and
/// updated at `checkpoint`).
///
/// A reader holding this view treats a version `v` as visible iff
/// `v` is one of its own write pointers, or `v <= read_pointer` and `v` is
/// neither invalid nor was in progress when the view was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    transaction_id: TxId,
    read_pointer: TxId,
    write_pointer: TxId,
    invalids: Vec<TxId>,
    in_progress: Vec<TxId>,
    first_short_in_progress: TxId,
    checkpoint_write_pointers: Vec<TxId>,
    tx_type: TransactionType,
}

impl Transaction {
    /// Build a view. `invalids` and `in_progress` must be sorted ascending;
    /// both are binary-searched on every visibility check.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transaction_id: TxId,
        read_pointer: TxId,
        write_pointer: TxId,
        invalids: Vec<TxId>,
        in_progress: Vec<TxId>,
        first_short_in_progress: TxId,
        checkpoint_write_pointers: Vec<TxId>,
        tx_type: TransactionType,
    ) -> Self {
        debug_assert!(invalids.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(in_progress.windows(2).all(|w| w[0] < w[1]));
        Transaction {
            transaction_id,
            read_pointer,
            write_pointer,
            invalids,
            in_progress,
            first_short_in_progress,
            checkpoint_write_pointers,
            tx_type,
        }
    }

    /// Derive the view for the same logical transaction after a checkpoint:
    /// the visibility snapshot is unchanged, only the write pointer moves
    /// and the prior write pointer is retained for own-write reads.
    pub fn with_checkpoint(&self, new_write_pointer: TxId) -> Self {
        let mut checkpoints = self.checkpoint_write_pointers.clone();
        checkpoints.push(self.write_pointer);
        Transaction {
            write_pointer: new_write_pointer,
            checkpoint_write_pointers: checkpoints,
            ..self.clone()
        }
    }

    /// The allocating id. Never changes across checkpoints.
    pub fn transaction_id(&self) -> TxId {
        self.transaction_id
    }

    /// The id new writes are stamped with.
    pub fn write_pointer(&self) -> TxId {
        self.write_pointer
    }

    /// Upper bound (inclusive) of versions to consider on read.
    pub fn read_pointer(&self) -> TxId {
        self.read_pointer
    }

    pub fn invalids(&self) -> &[TxId] {
        &self.invalids
    }

    pub fn in_progress(&self) -> &[TxId] {
        &self.in_progress
    }

    /// Smallest id of any SHORT in-progress transaction, or
    /// [`NO_TX_IN_PROGRESS`]. Scans can skip exclusion checks for versions
    /// below this boundary.
    pub fn first_short_in_progress(&self) -> TxId {
        self.first_short_in_progress
    }

    pub fn checkpoint_write_pointers(&self) -> &[TxId] {
        &self.checkpoint_write_pointers
    }

    pub fn tx_type(&self) -> TransactionType {
        self.tx_type
    }

    /// Snapshot-isolation visibility rule.
    pub fn is_visible(&self, version: TxId) -> bool {
        if self.is_own_write(version) {
            return true;
        }
        version <= self.read_pointer && !self.is_excluded(version)
    }

    /// True when `version` was produced by this logical transaction
    /// (current write pointer, allocating id, or a prior checkpoint).
    pub fn is_own_write(&self, version: TxId) -> bool {
        version == self.write_pointer
            || version == self.transaction_id
            || self.checkpoint_write_pointers.binary_search(&version).is_ok()
    }

    /// True when `version` must be ignored: invalid, or concurrent with
    /// this transaction.
    pub fn is_excluded(&self, version: TxId) -> bool {
        self.invalids.binary_search(&version).is_ok()
            || self.in_progress.binary_search(&version).is_ok()
    }

    /// Whether any exclusion can apply at or below `version`. Readers use
    /// this to short-circuit per-cell checks during range scans.
    pub fn has_exclusions_below(&self, version: TxId) -> bool {
        self.first_short_in_progress <= version
            || self.invalids.first().is_some_and(|&v| v <= version)
            || self.in_progress.first().is_some_and(|&v| v <= version)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn view(
        id: TxId,
        read: TxId,
        invalids: Vec<TxId>,
        in_progress: Vec<TxId>,
    ) -> Transaction {
        Transaction::new(
            id,
            read,
            id,
            invalids,
            in_progress,
            NO_TX_IN_PROGRESS,
            vec![],
            TransactionType::Short,
        )
    }

    #[test]
    fn type_codes_round_trip() {
        for t in [
            TransactionType::Short,
            TransactionType::Long,
            TransactionType::Checkpoint,
        ] {
            assert_eq!(TransactionType::from_byte(t.to_byte()), Some(t));
        }
        assert_eq!(TransactionType::from_byte(0), None);
        assert_eq!(TransactionType::from_byte(4), None);
    }

    #[test]
    fn type_codes_are_stable() {
        // Durable format: these exact values are written to logs and
        // snapshots and must never change.
        assert_eq!(TransactionType::Short.to_byte(), 1);
        assert_eq!(TransactionType::Long.to_byte(), 2);
        assert_eq!(TransactionType::Checkpoint.to_byte(), 3);
    }

    #[test]
    fn change_id_equality_is_on_raw_bytes() {
        let a = ChangeId::new(vec![0x61]);
        let b = ChangeId::new(b"a".to_vec());
        let c = ChangeId::new(vec![0x62]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(format!("{}", a), "61");
    }

    #[test]
    fn own_writes_are_visible() {
        let tx = view(1000, 999, vec![], vec![]);
        assert!(tx.is_visible(1000));
        let after_checkpoint = tx.with_checkpoint(1005);
        assert!(after_checkpoint.is_visible(1000));
        assert!(after_checkpoint.is_visible(1005));
        assert_eq!(after_checkpoint.transaction_id(), 1000);
        assert_eq!(after_checkpoint.checkpoint_write_pointers(), &[1000]);
    }

    #[test]
    fn committed_below_read_pointer_is_visible() {
        let tx = view(1000, 999, vec![], vec![]);
        assert!(tx.is_visible(999));
        assert!(tx.is_visible(1));
        assert!(!tx.is_visible(1001));
    }

    #[test]
    fn invalid_and_in_progress_are_excluded() {
        let tx = view(1000, 999, vec![995], vec![997, 998]);
        assert!(!tx.is_visible(995));
        assert!(!tx.is_visible(997));
        assert!(!tx.is_visible(998));
        assert!(tx.is_visible(996));
        assert!(tx.is_visible(999));
    }

    #[test]
    fn expiration_checks() {
        let short = InProgressTx::new(10, 1_000, TransactionType::Short);
        assert!(short.is_expired_at(1_001));
        assert!(!short.is_expired_at(999));

        let long = InProgressTx::new(10, NO_EXPIRATION, TransactionType::Long);
        assert!(!long.is_expired_at(i64::MAX - 1));

        let legacy = InProgressTx::without_type(10, 1_000);
        assert!(legacy.tx_type.is_none());
    }
}
