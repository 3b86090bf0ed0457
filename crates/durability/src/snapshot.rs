//! Full-state snapshot records.
//!
//! A [`TransactionSnapshot`] is a point-in-time dump of the transaction
//! manager's canonical tuple. Snapshots compress the edit log: recovery
//! decodes the newest snapshot and replays only the edits logged after it.
//!
//! The serialized form (see `codec`) is split into a **visibility prefix**
//! (timestamp, pointers, in-progress map, invalid list) and a **tail**
//! (committing + committed change-sets). Read-only followers that only need
//! visibility can decode the prefix alone, via
//! [`TransactionVisibilityState`], even when the tail is corrupt.

use keystone_core::{ChangeId, InProgressTx, TxId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Point-in-time dump of the full manager state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    /// Wall-clock millis when the snapshot was taken.
    pub timestamp: i64,
    /// Upper bound of ids no longer in progress.
    pub read_pointer: TxId,
    /// Highest id ever allocated.
    pub write_pointer: TxId,
    /// Poisoned ids, ascending.
    pub invalid: Vec<TxId>,
    /// In-progress transactions by id.
    pub in_progress: BTreeMap<TxId, InProgressTx>,
    /// Change-sets recorded by `can_commit`, awaiting `commit`.
    pub committing_change_sets: BTreeMap<TxId, BTreeSet<ChangeId>>,
    /// Change-sets of committed transactions, keyed by commit pointer,
    /// retained until pruned.
    pub committed_change_sets: BTreeMap<TxId, BTreeSet<ChangeId>>,
}

impl TransactionSnapshot {
    /// The visibility projection of this snapshot.
    pub fn visibility_state(&self) -> TransactionVisibilityState {
        TransactionVisibilityState {
            timestamp: self.timestamp,
            read_pointer: self.read_pointer,
            write_pointer: self.write_pointer,
            invalid: self.invalid.clone(),
            in_progress: self.in_progress.clone(),
        }
    }

    /// An empty snapshot at time zero; the starting state of a brand-new
    /// coordinator.
    pub fn empty() -> Self {
        TransactionSnapshot {
            timestamp: 0,
            read_pointer: 0,
            write_pointer: 0,
            invalid: Vec::new(),
            in_progress: BTreeMap::new(),
            committing_change_sets: BTreeMap::new(),
            committed_change_sets: BTreeMap::new(),
        }
    }
}

/// The forward-readable prefix of a snapshot: everything a reader needs to
/// apply visibility rules, nothing it doesn't.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionVisibilityState {
    /// Wall-clock millis when the snapshot was taken.
    pub timestamp: i64,
    /// Upper bound of ids no longer in progress.
    pub read_pointer: TxId,
    /// Highest id ever allocated.
    pub write_pointer: TxId,
    /// Poisoned ids, ascending.
    pub invalid: Vec<TxId>,
    /// In-progress transactions by id.
    pub in_progress: BTreeMap<TxId, InProgressTx>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::{TransactionType, NO_EXPIRATION};

    #[test]
    fn visibility_projection_drops_change_sets() {
        let mut snapshot = TransactionSnapshot::empty();
        snapshot.timestamp = 42;
        snapshot.read_pointer = 10;
        snapshot.write_pointer = 12;
        snapshot.invalid = vec![3, 7];
        snapshot.in_progress.insert(
            11,
            InProgressTx::new(10, NO_EXPIRATION, TransactionType::Long),
        );
        snapshot
            .committed_change_sets
            .insert(9, [ChangeId::new(vec![1u8])].into_iter().collect());

        let vis = snapshot.visibility_state();
        assert_eq!(vis.timestamp, 42);
        assert_eq!(vis.read_pointer, 10);
        assert_eq!(vis.write_pointer, 12);
        assert_eq!(vis.invalid, vec![3, 7]);
        assert_eq!(vis.in_progress.len(), 1);
    }
}
