//! Recovery tests: replaying the edit log onto the latest snapshot must
//! reproduce the pre-crash state, and legacy snapshots must load with
//! their in-progress types reconstructed.

use keystone_concurrency::{restore_in_progress_types, TransactionManager};
use keystone_core::{
    ChangeId, InProgressTx, SnapshotConfig, TransactionType, TxConfig, NO_EXPIRATION,
};
use keystone_durability::{
    InMemoryTxStorage, LocalFileTxStorage, SnapshotCodecProvider, TransactionSnapshot,
    TxStateStorage,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

fn manager_on(storage: Arc<dyn TxStateStorage>) -> Arc<TransactionManager> {
    Arc::new(TransactionManager::new(TxConfig::for_testing(), storage))
}

fn change(bytes: &[u8]) -> ChangeId {
    ChangeId::from(bytes)
}

/// Run a representative workload: commits, aborts, invalidations,
/// checkpoints, truncations, a pending can_commit.
fn run_workload(mgr: &Arc<TransactionManager>) {
    let tx1 = mgr.start_short(None).unwrap();
    assert!(mgr.can_commit(&tx1, vec![change(b"a")]).unwrap());
    assert!(mgr.commit(&tx1).unwrap());

    let tx2 = mgr.start_short(None).unwrap();
    mgr.abort(&tx2).unwrap();

    let tx3 = mgr.start_short(None).unwrap();
    assert!(mgr.invalidate(tx3.transaction_id()).unwrap());

    let tx4 = mgr.start_long().unwrap();
    let tx4 = mgr.checkpoint(&tx4).unwrap();
    let _ = tx4;

    // Leave one transaction mid-protocol: can_commit recorded, no commit.
    let tx5 = mgr.start_short(None).unwrap();
    assert!(mgr.can_commit(&tx5, vec![change(b"pending")]).unwrap());
}

/// Compare everything except the capture timestamp.
fn assert_states_equal(before: &TransactionSnapshot, after: &TransactionSnapshot) {
    assert_eq!(before.read_pointer, after.read_pointer);
    assert_eq!(before.write_pointer, after.write_pointer);
    assert_eq!(before.invalid, after.invalid);
    assert_eq!(before.in_progress, after.in_progress);
    assert_eq!(before.committing_change_sets, after.committing_change_sets);
    assert_eq!(before.committed_change_sets, after.committed_change_sets);
}

#[test]
fn replay_without_snapshot_reproduces_state() {
    let storage: Arc<InMemoryTxStorage> = Arc::new(InMemoryTxStorage::new());

    let mgr = manager_on(storage.clone());
    mgr.start().unwrap();
    run_workload(&mgr);
    let before = mgr.snapshot_state();
    drop(mgr); // crash: no shutdown snapshot

    let recovered = manager_on(storage);
    recovered.start().unwrap();
    assert_states_equal(&before, &recovered.snapshot_state());
}

#[test]
fn replay_on_top_of_snapshot_reproduces_state() {
    let storage: Arc<InMemoryTxStorage> = Arc::new(InMemoryTxStorage::new());

    let mgr = manager_on(storage.clone());
    mgr.start().unwrap();
    run_workload(&mgr);
    mgr.take_snapshot().unwrap();

    // More activity after the snapshot, only present in the new log.
    let tx = mgr.start_short(None).unwrap();
    assert!(mgr.can_commit(&tx, vec![change(b"post-snapshot")]).unwrap());
    assert!(mgr.commit(&tx).unwrap());
    let victim = mgr.start_short(None).unwrap();
    mgr.invalidate(victim.transaction_id()).unwrap();

    let before = mgr.snapshot_state();
    drop(mgr);

    let recovered = manager_on(storage);
    recovered.start().unwrap();
    assert_states_equal(&before, &recovered.snapshot_state());
}

#[test]
fn restart_from_files_with_clean_shutdown() {
    let dir = TempDir::new().unwrap();
    let config = SnapshotConfig::new(dir.path());

    let before = {
        let storage = Arc::new(LocalFileTxStorage::new(&config).unwrap());
        let mgr = manager_on(storage);
        mgr.start().unwrap();
        run_workload(&mgr);
        let state = mgr.snapshot_state();
        mgr.stop().unwrap();
        state
    };

    let storage = Arc::new(LocalFileTxStorage::new(&config).unwrap());
    let recovered = manager_on(storage);
    recovered.start().unwrap();
    assert_states_equal(&before, &recovered.snapshot_state());
    recovered.stop().unwrap();
}

#[test]
fn restart_from_files_after_crash() {
    let dir = TempDir::new().unwrap();
    let config = SnapshotConfig::new(dir.path());

    let before = {
        let storage = Arc::new(LocalFileTxStorage::new(&config).unwrap());
        let mgr = manager_on(storage);
        mgr.start().unwrap();
        run_workload(&mgr);
        let state = mgr.snapshot_state();
        drop(mgr); // no stop(): only the edit log survives
        state
    };

    let storage = Arc::new(LocalFileTxStorage::new(&config).unwrap());
    let recovered = manager_on(storage);
    recovered.start().unwrap();
    assert_states_equal(&before, &recovered.snapshot_state());
}

#[test]
fn reset_state_survives_replay() {
    let storage: Arc<InMemoryTxStorage> = Arc::new(InMemoryTxStorage::new());
    let mgr = manager_on(storage.clone());
    mgr.start().unwrap();
    run_workload(&mgr);
    mgr.reset_state().unwrap();
    let before = mgr.snapshot_state();
    drop(mgr);

    let recovered = manager_on(storage);
    recovered.start().unwrap();
    let after = recovered.snapshot_state();
    assert!(after.in_progress.is_empty());
    assert!(after.invalid.is_empty());
    assert!(after.committed_change_sets.is_empty());
    assert_eq!(before.write_pointer, after.write_pointer);
    assert_eq!(before.read_pointer, after.read_pointer);
}

#[test]
fn legacy_snapshot_loads_with_types_reconstructed() {
    // A snapshot the way an early coordinator would have held it: one
    // LONG transaction (no expiration) and one SHORT, types known.
    let mut original = TransactionSnapshot::empty();
    original.timestamp = 1_700_000_000_000;
    original.read_pointer = 96;
    original.write_pointer = 100;
    original.invalid = vec![95];
    original.in_progress.insert(
        97,
        InProgressTx::new(96, NO_EXPIRATION, TransactionType::Long),
    );
    original.in_progress.insert(
        99,
        InProgressTx::new(96, 1_700_000_030_000, TransactionType::Short),
    );
    original.committing_change_sets.insert(
        99,
        [change(b"r3"), change(b"r4")].into_iter().collect(),
    );
    original.committed_change_sets.insert(
        98,
        [change(b"r1"), change(b"r2")].into_iter().collect(),
    );

    // Written by the legacy codec: the type byte is simply absent.
    let legacy = SnapshotCodecProvider::from_versions(&[1]).unwrap();
    let bytes = legacy.encode(&original);

    // Loaded by a current coordinator.
    let current = SnapshotCodecProvider::new_default();
    let mut decoded = current.decode(&bytes).unwrap();
    assert!(decoded.in_progress.values().all(|e| e.tx_type.is_none()));

    restore_in_progress_types(&mut decoded.in_progress);
    assert_eq!(
        decoded.in_progress.get(&97).unwrap().tx_type,
        Some(TransactionType::Long)
    );
    assert_eq!(
        decoded.in_progress.get(&99).unwrap().tx_type,
        Some(TransactionType::Short)
    );
    // After the fix-up the full snapshot matches the original.
    assert_eq!(decoded, original);
}

#[test]
fn manager_recovers_legacy_snapshot_end_to_end() {
    // Persist a legacy-encoded snapshot through a storage configured for
    // V1 only, then recover with a default manager.
    let dir = TempDir::new().unwrap();
    let legacy_config =
        SnapshotConfig::new(dir.path()).with_codec_versions(vec![1]);
    let legacy_storage = Arc::new(LocalFileTxStorage::new(&legacy_config).unwrap());

    let mut snapshot = TransactionSnapshot::empty();
    snapshot.timestamp = 1_700_000_000_000;
    snapshot.read_pointer = 10;
    snapshot.write_pointer = 12;
    let mut in_progress = BTreeMap::new();
    in_progress.insert(11u64, InProgressTx::new(10, NO_EXPIRATION, TransactionType::Long));
    snapshot.in_progress = in_progress;
    legacy_storage.write_snapshot(&snapshot).unwrap();

    let storage = Arc::new(LocalFileTxStorage::new(&SnapshotConfig::new(dir.path())).unwrap());
    let mgr = manager_on(storage);
    mgr.start().unwrap();

    let state = mgr.snapshot_state();
    assert_eq!(
        state.in_progress.get(&11).unwrap().tx_type,
        Some(TransactionType::Long)
    );
    assert_eq!(state.write_pointer, 12);
}
