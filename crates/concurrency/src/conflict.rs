//! Write-write conflict detection.
//!
//! A committing transaction T with visibility upper bound V and proposed
//! changes C conflicts iff some transaction committed *after* V touched a
//! change in C:
//!
//! ```text
//! ∃ k > V such that committed_change_sets[k] ∩ C ≠ ∅
//! ```
//!
//! Only fully-committed change-sets participate; committing sets recorded
//! by `can_commit` are advisory and never cause a conflict themselves.
//! The committed map is keyed by commit pointer, so the check walks the
//! tail range `(V, +∞)` and stops at the first intersection.

use keystone_core::{ChangeId, TxId};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// First conflicting (committed tx, change) pair, or `None` when the
/// change-set is admissible.
pub fn find_conflict<'a>(
    committed_change_sets: &'a BTreeMap<TxId, BTreeSet<ChangeId>>,
    visibility_upper_bound: TxId,
    changes: &BTreeSet<ChangeId>,
) -> Option<(TxId, &'a ChangeId)> {
    if changes.is_empty() {
        return None;
    }
    let tail = committed_change_sets
        .range((Bound::Excluded(visibility_upper_bound), Bound::Unbounded));
    for (&committed_tx, committed_changes) in tail {
        // Intersect from the smaller side.
        let (probe, base): (&BTreeSet<ChangeId>, &BTreeSet<ChangeId>) =
            if committed_changes.len() < changes.len() {
                (committed_changes, changes)
            } else {
                (changes, committed_changes)
            };
        for change in probe {
            if base.contains(change) {
                // Report the change itself, borrowed from the committed set
                // when that side was probed.
                let hit = committed_changes
                    .get(change)
                    .expect("intersection member present in committed set");
                return Some((committed_tx, hit));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changes(items: &[&[u8]]) -> BTreeSet<ChangeId> {
        items.iter().map(|b| ChangeId::from(*b)).collect()
    }

    fn committed(entries: &[(TxId, &[&[u8]])]) -> BTreeMap<TxId, BTreeSet<ChangeId>> {
        entries
            .iter()
            .map(|(id, items)| (*id, changes(items)))
            .collect()
    }

    #[test]
    fn no_conflict_when_disjoint() {
        let map = committed(&[(10, &[b"a"]), (20, &[b"b"])]);
        assert!(find_conflict(&map, 5, &changes(&[b"c", b"d"])).is_none());
    }

    #[test]
    fn conflict_above_visibility_bound() {
        let map = committed(&[(10, &[b"a"])]);
        let (tx, change) = find_conflict(&map, 5, &changes(&[b"a"])).unwrap();
        assert_eq!(tx, 10);
        assert_eq!(change.as_bytes(), b"a");
    }

    #[test]
    fn commits_at_or_below_bound_are_ignored() {
        // Key 10 is not above the bound 10: T already saw it.
        let map = committed(&[(10, &[b"a"])]);
        assert!(find_conflict(&map, 10, &changes(&[b"a"])).is_none());
        assert!(find_conflict(&map, 11, &changes(&[b"a"])).is_none());
    }

    #[test]
    fn first_conflict_in_key_order_wins() {
        let map = committed(&[(10, &[b"x"]), (20, &[b"a"]), (30, &[b"a"])]);
        let (tx, _) = find_conflict(&map, 5, &changes(&[b"a"])).unwrap();
        assert_eq!(tx, 20);
    }

    #[test]
    fn empty_change_set_never_conflicts() {
        let map = committed(&[(10, &[b"a"])]);
        assert!(find_conflict(&map, 0, &BTreeSet::new()).is_none());
    }

    #[test]
    fn equality_is_on_raw_bytes() {
        let map = committed(&[(10, &[&[0x61u8][..]])]);
        // b"a" == [0x61]
        assert!(find_conflict(&map, 0, &changes(&[b"a"])).is_some());
        assert!(find_conflict(&map, 0, &changes(&[b"A"])).is_none());
    }
}
