//! The transaction manager state machine.
//!
//! The manager owns the canonical state tuple — write pointer, read
//! pointer, in-progress map, invalid list, committing and committed
//! change-sets — and serializes every transition behind a single lock.
//! Each mutating operation follows the same shape:
//!
//! 1. validate against current state
//! 2. build the edit describing the mutation
//! 3. append the edit to the log (durability point; failure leaves state
//!    untouched and surfaces to the caller)
//! 4. apply the mutation
//!
//! Replay uses the same `apply_*` mutation functions as live operations,
//! so decoding the latest snapshot and replaying subsequent edits
//! reproduces the pre-crash state exactly (up to pruning, which is never
//! logged).
//!
//! ## Background tasks
//!
//! `start` runs crash recovery, opens a fresh log segment and spawns two
//! threads: the expiration sweep (invalidates timed-out SHORT
//! transactions) and the periodic snapshot task. Both exit promptly on
//! `stop`, which also writes a final snapshot.

use crate::conflict::find_conflict;
use keystone_core::{
    now_millis, ChangeId, InProgressTx, Result, Transaction, TransactionType, TxConfig, TxError,
    TxId, NO_EXPIRATION, NO_TX_IN_PROGRESS,
};
use keystone_durability::{
    SnapshotCodecProvider, TransactionEdit, TransactionLog, TransactionSnapshot, TxStateStorage,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

// ============================================================================
// Legacy snapshot fix-up
// ============================================================================

/// Reconstruct the transaction types of in-progress entries loaded from a
/// legacy snapshot that did not serialize them: an entry with a negative
/// expiration can only be LONG, everything else ran under a timeout and is
/// reinterpreted as SHORT.
pub fn restore_in_progress_types(in_progress: &mut BTreeMap<TxId, InProgressTx>) {
    for (tx_id, entry) in in_progress.iter_mut() {
        if entry.tx_type.is_none() {
            let restored = if entry.expiration < 0 {
                TransactionType::Long
            } else {
                TransactionType::Short
            };
            trace!(tx_id, %restored, "restored in-progress type from legacy snapshot");
            entry.tx_type = Some(restored);
        }
    }
}

// ============================================================================
// Manager state
// ============================================================================

struct ManagerState {
    read_pointer: TxId,
    write_pointer: TxId,
    in_progress: BTreeMap<TxId, InProgressTx>,
    invalid: Vec<TxId>,
    committing_change_sets: BTreeMap<TxId, BTreeSet<ChangeId>>,
    committed_change_sets: BTreeMap<TxId, BTreeSet<ChangeId>>,
    /// Open segment for the current snapshot epoch. `None` until `start`
    /// has run; appends then carry no durability, which is what embedded
    /// unit tests want.
    log: Option<Box<dyn TransactionLog>>,
}

impl ManagerState {
    fn empty() -> Self {
        ManagerState {
            read_pointer: 0,
            write_pointer: 0,
            in_progress: BTreeMap::new(),
            invalid: Vec::new(),
            committing_change_sets: BTreeMap::new(),
            committed_change_sets: BTreeMap::new(),
            log: None,
        }
    }

    /// Append one edit group; the durability point of every operation.
    fn append(&mut self, edits: &[TransactionEdit]) -> Result<()> {
        if let Some(log) = self.log.as_mut() {
            log.append(edits)?;
        }
        Ok(())
    }

    fn insert_invalid(&mut self, tx_id: TxId) -> bool {
        match self.invalid.binary_search(&tx_id) {
            Ok(_) => false,
            Err(pos) => {
                self.invalid.insert(pos, tx_id);
                true
            }
        }
    }

    /// Remove a transaction and its checkpoint entries from the
    /// in-progress map. Returns the removed parent entry.
    fn remove_in_progress(&mut self, tx_id: TxId) -> Option<InProgressTx> {
        let entry = self.in_progress.remove(&tx_id)?;
        for cp in &entry.checkpoint_write_pointers {
            self.in_progress.remove(cp);
        }
        Some(entry)
    }

    fn advance_read_pointer(&mut self) {
        let min_in_progress = self.in_progress.keys().next().copied();
        if min_in_progress.map_or(true, |min| min > self.read_pointer) {
            self.read_pointer = self.write_pointer;
        }
    }

    // ------------------------------------------------------------------
    // Mutations, shared between live operations and replay
    // ------------------------------------------------------------------

    fn apply_in_progress(
        &mut self,
        tx_id: TxId,
        visibility_upper_bound: TxId,
        expiration: i64,
        tx_type: TransactionType,
    ) {
        self.write_pointer = self.write_pointer.max(tx_id);
        self.in_progress.insert(
            tx_id,
            InProgressTx::new(visibility_upper_bound, expiration, tx_type),
        );
    }

    fn apply_can_commit(&mut self, tx_id: TxId, changes: BTreeSet<ChangeId>) {
        self.committing_change_sets.insert(tx_id, changes);
    }

    fn apply_committed(
        &mut self,
        tx_id: TxId,
        commit_pointer: TxId,
        changes: BTreeSet<ChangeId>,
    ) {
        self.write_pointer = self.write_pointer.max(commit_pointer);
        self.remove_in_progress(tx_id);
        self.committing_change_sets.remove(&tx_id);
        if !changes.is_empty() {
            self.committed_change_sets.insert(commit_pointer, changes);
        }
        self.advance_read_pointer();
    }

    fn apply_aborted(&mut self, tx_id: TxId) {
        self.remove_in_progress(tx_id);
        self.committing_change_sets.remove(&tx_id);
    }

    fn apply_invalid(&mut self, tx_id: TxId) -> bool {
        let mut changed = false;
        if let Some(entry) = self.remove_in_progress(tx_id) {
            changed = true;
            for cp in &entry.checkpoint_write_pointers {
                self.insert_invalid(*cp);
            }
        }
        changed |= self.committing_change_sets.remove(&tx_id).is_some();
        if changed {
            self.insert_invalid(tx_id);
        }
        changed
    }

    /// Epoch marker: discard everything before it and restart both
    /// pointers at the watermark. Replay must blank the maps exactly like
    /// the live reset did.
    fn apply_move_watermark(&mut self, write_pointer: TxId) {
        self.in_progress.clear();
        self.invalid.clear();
        self.committing_change_sets.clear();
        self.committed_change_sets.clear();
        self.write_pointer = self.write_pointer.max(write_pointer);
        self.read_pointer = self.write_pointer;
    }

    fn apply_truncate_invalid(&mut self, tx_ids: &BTreeSet<TxId>) -> bool {
        let before = self.invalid.len();
        self.invalid.retain(|id| !tx_ids.contains(id));
        self.invalid.len() != before
    }

    fn apply_checkpoint(&mut self, tx_id: TxId, write_pointer: TxId) {
        self.write_pointer = self.write_pointer.max(write_pointer);
        let Some(parent) = self.in_progress.get_mut(&tx_id) else {
            return;
        };
        parent.checkpoint_write_pointers.push(write_pointer);
        let entry = InProgressTx::new(
            parent.visibility_upper_bound,
            parent.expiration,
            TransactionType::Checkpoint,
        );
        self.in_progress.insert(write_pointer, entry);
    }

    fn replay(&mut self, edit: TransactionEdit) {
        match edit {
            TransactionEdit::InProgress {
                tx_id,
                visibility_upper_bound,
                expiration,
                tx_type,
            } => self.apply_in_progress(tx_id, visibility_upper_bound, expiration, tx_type),
            TransactionEdit::CanCommit { tx_id, changes } => {
                self.apply_can_commit(tx_id, changes)
            }
            TransactionEdit::Committed {
                tx_id,
                commit_pointer,
                changes,
            } => self.apply_committed(tx_id, commit_pointer, changes),
            TransactionEdit::Aborted { tx_id } => self.apply_aborted(tx_id),
            TransactionEdit::Invalid { tx_id } => {
                self.apply_invalid(tx_id);
            }
            TransactionEdit::MoveWatermark { write_pointer } => {
                self.apply_move_watermark(write_pointer)
            }
            TransactionEdit::TruncateInvalidTx { tx_ids } => {
                self.apply_truncate_invalid(&tx_ids);
            }
            TransactionEdit::Checkpoint {
                tx_id,
                write_pointer,
            } => self.apply_checkpoint(tx_id, write_pointer),
        }
    }

    // ------------------------------------------------------------------
    // Views and snapshots
    // ------------------------------------------------------------------

    /// Build the client view for `tx_id`, excluding the transaction's own
    /// entries from the exclusion sets.
    fn build_view(&self, tx_id: TxId, tx_type: TransactionType) -> Transaction {
        let mut in_progress_ids = Vec::with_capacity(self.in_progress.len());
        let mut first_short = NO_TX_IN_PROGRESS;
        for (&id, entry) in &self.in_progress {
            if id == tx_id {
                continue;
            }
            in_progress_ids.push(id);
            if first_short == NO_TX_IN_PROGRESS
                && entry.tx_type == Some(TransactionType::Short)
            {
                first_short = id;
            }
        }
        Transaction::new(
            tx_id,
            self.read_pointer,
            tx_id,
            self.invalid.clone(),
            in_progress_ids,
            first_short,
            Vec::new(),
            tx_type,
        )
    }

    fn to_snapshot(&self, timestamp: i64) -> TransactionSnapshot {
        TransactionSnapshot {
            timestamp,
            read_pointer: self.read_pointer,
            write_pointer: self.write_pointer,
            invalid: self.invalid.clone(),
            in_progress: self.in_progress.clone(),
            committing_change_sets: self.committing_change_sets.clone(),
            committed_change_sets: self.committed_change_sets.clone(),
        }
    }

    fn install_snapshot(&mut self, snapshot: TransactionSnapshot) {
        self.read_pointer = snapshot.read_pointer;
        self.write_pointer = snapshot.write_pointer;
        self.invalid = snapshot.invalid;
        self.in_progress = snapshot.in_progress;
        self.committing_change_sets = snapshot.committing_change_sets;
        self.committed_change_sets = snapshot.committed_change_sets;
        restore_in_progress_types(&mut self.in_progress);
    }
}

// ============================================================================
// TransactionManager
// ============================================================================

/// The coordinator's in-memory state machine.
///
/// All operations are serialized behind one lock; the edit-log flush
/// happens inside the critical section so that log order equals mutation
/// order and a successful `commit` implies a durable COMMITTED edit.
pub struct TransactionManager {
    config: TxConfig,
    storage: Arc<dyn TxStateStorage>,
    provider: SnapshotCodecProvider,
    state: Mutex<ManagerState>,
    started: AtomicBool,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionManager {
    pub fn new(config: TxConfig, storage: Arc<dyn TxStateStorage>) -> Self {
        TransactionManager {
            config,
            storage,
            provider: SnapshotCodecProvider::new_default(),
            state: Mutex::new(ManagerState::empty()),
            started: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Replace the snapshot codec provider (e.g. restricted versions from
    /// configuration).
    pub fn with_codec_provider(mut self, provider: SnapshotCodecProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Recover state from storage, open a fresh log segment and spawn the
    /// background tasks.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::SeqCst);
        self.recover()?;

        let mut threads = self.threads.lock();

        // Threads hold weak references so an orphaned manager (dropped
        // without `stop`) still unwinds instead of leaking a cycle.
        let sweeper = Arc::downgrade(self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.cleanup_interval();
        threads.push(std::thread::spawn(move || {
            debug!("expiration sweep thread started");
            while !sleep_interruptibly(&shutdown, interval) {
                let Some(manager) = sweeper.upgrade() else { break };
                manager.sweep_expired();
            }
            debug!("expiration sweep thread exiting");
        }));

        let snapshotter = Arc::downgrade(self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.snapshot_interval();
        threads.push(std::thread::spawn(move || {
            debug!("snapshot thread started");
            while !sleep_interruptibly(&shutdown, interval) {
                let Some(manager) = snapshotter.upgrade() else { break };
                if let Err(e) = manager.take_snapshot() {
                    warn!(error = %e, "periodic snapshot failed");
                }
            }
            debug!("snapshot thread exiting");
        }));

        info!(storage = %self.storage.location(), "transaction manager started");
        Ok(())
    }

    /// Stop background tasks, write a final snapshot and close the log.
    pub fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        self.take_snapshot()?;
        let mut state = self.state.lock();
        if let Some(mut log) = state.log.take() {
            log.close()?;
        }
        info!("transaction manager stopped");
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        let snapshot = self.storage.latest_snapshot()?;
        let mut state = self.state.lock();

        let replay_from = match snapshot {
            Some(snapshot) => {
                let ts = snapshot.timestamp;
                info!(
                    timestamp = ts,
                    write_pointer = snapshot.write_pointer,
                    "recovering from snapshot"
                );
                state.install_snapshot(snapshot);
                ts
            }
            None => {
                debug!("no snapshot found, replaying all logs");
                0
            }
        };

        let edits = self.storage.edits_since(replay_from)?;
        let replayed = edits.len();
        for edit in edits {
            state.replay(edit);
        }
        if replayed > 0 {
            info!(edits = replayed, "replayed edit log");
        }

        // Open the segment for the new epoch, strictly after anything
        // already on disk so file names never collide.
        let log_ts = now_millis()
            .max(self.storage.latest_log_timestamp()?.map_or(0, |t| t + 1))
            .max(replay_from + 1);
        state.log = Some(self.storage.create_log(log_ts)?);

        if replay_from > 0 {
            self.storage.delete_logs_older_than(replay_from)?;
        }
        Ok(())
    }

    /// Whether `start` has run (and `stop` has not).
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Service status string for the façade.
    pub fn status(&self) -> String {
        if self.is_started() { "OK" } else { "STOPPED" }.to_string()
    }

    // ------------------------------------------------------------------
    // Id allocation
    // ------------------------------------------------------------------

    fn next_write_pointer(&self, state: &ManagerState) -> TxId {
        let time_based = now_millis().max(0) as u64 * self.config.max_tx_per_ms;
        (state.write_pointer + 1).max(time_based)
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Start a SHORT transaction. `timeout_secs = None` uses the
    /// configured default; an explicit value must satisfy
    /// `0 < timeout <= max_timeout`.
    pub fn start_short(&self, timeout_secs: Option<u32>) -> Result<Transaction> {
        let timeout = timeout_secs.unwrap_or(self.config.default_timeout_secs);
        if timeout == 0 || timeout > self.config.max_timeout_secs {
            return Err(TxError::invalid_argument(format!(
                "timeout must be in (0, {}] seconds, got {}",
                self.config.max_timeout_secs, timeout
            )));
        }
        let expiration = now_millis() + i64::from(timeout) * 1000;
        self.start_tx(expiration, TransactionType::Short)
    }

    /// Start a LONG transaction; never auto-invalidated by the sweep.
    pub fn start_long(&self) -> Result<Transaction> {
        self.start_tx(NO_EXPIRATION, TransactionType::Long)
    }

    fn start_tx(&self, expiration: i64, tx_type: TransactionType) -> Result<Transaction> {
        let mut state = self.state.lock();
        let tx_id = self.next_write_pointer(&state);
        let visibility_upper_bound = state.read_pointer;
        state.append(&[TransactionEdit::InProgress {
            tx_id,
            visibility_upper_bound,
            expiration,
            tx_type,
        }])?;
        state.apply_in_progress(tx_id, visibility_upper_bound, expiration, tx_type);
        let view = state.build_view(tx_id, tx_type);
        debug!(tx_id, %tx_type, "started transaction");
        Ok(view)
    }

    /// Pre-commit conflict check. Records the change-set for `commit`;
    /// calling it again for the same transaction replaces the recorded
    /// set and appends a fresh edit.
    ///
    /// Returns `Ok(false)` on conflict — the transaction stays in
    /// progress and the caller decides whether to abort or retry the
    /// check with different changes.
    pub fn can_commit(&self, tx: &Transaction, changes: Vec<ChangeId>) -> Result<bool> {
        let tx_id = tx.transaction_id();
        let changes: BTreeSet<ChangeId> = changes.into_iter().collect();

        let mut state = self.state.lock();
        let entry = state
            .in_progress
            .get(&tx_id)
            .ok_or_else(|| TxError::not_in_progress(tx_id))?;
        if let Some((conflicting_tx, change)) = find_conflict(
            &state.committed_change_sets,
            entry.visibility_upper_bound,
            &changes,
        ) {
            debug!(
                tx_id,
                conflicting_tx,
                %change,
                "pre-commit conflict"
            );
            return Ok(false);
        }
        state.append(&[TransactionEdit::CanCommit {
            tx_id,
            changes: changes.clone(),
        }])?;
        state.apply_can_commit(tx_id, changes);
        Ok(true)
    }

    /// Commit. Re-checks conflicts against everything committed since the
    /// last `can_commit`; on conflict returns `Ok(false)` and leaves the
    /// transaction in progress (the caller must abort it).
    pub fn commit(&self, tx: &Transaction) -> Result<bool> {
        let tx_id = tx.transaction_id();
        let mut state = self.state.lock();
        let entry = state
            .in_progress
            .get(&tx_id)
            .ok_or_else(|| TxError::not_in_progress(tx_id))?;
        let changes = state
            .committing_change_sets
            .get(&tx_id)
            .cloned()
            .unwrap_or_default();
        if let Some((conflicting_tx, change)) = find_conflict(
            &state.committed_change_sets,
            entry.visibility_upper_bound,
            &changes,
        ) {
            debug!(tx_id, conflicting_tx, %change, "commit conflict");
            return Ok(false);
        }

        // The committed change-set is keyed by a freshly allocated commit
        // pointer: strictly above every concurrent transaction, so it can
        // never collide with an in-progress id and always lands above any
        // concurrent reader's visibility bound.
        let commit_pointer = self.next_write_pointer(&state).max(tx.write_pointer());
        state.append(&[TransactionEdit::Committed {
            tx_id,
            commit_pointer,
            changes: changes.clone(),
        }])?;
        state.apply_committed(tx_id, commit_pointer, changes);
        debug!(
            tx_id,
            commit_pointer,
            read_pointer = state.read_pointer,
            "committed transaction"
        );
        Ok(true)
    }

    /// Abort. Idempotent: aborting a transaction that already timed out
    /// (and was invalidated) or was never started is a no-op.
    pub fn abort(&self, tx: &Transaction) -> Result<()> {
        let tx_id = tx.transaction_id();
        let mut state = self.state.lock();
        if !state.in_progress.contains_key(&tx_id) {
            trace!(tx_id, "abort of unknown or expired transaction ignored");
            return Ok(());
        }
        state.append(&[TransactionEdit::Aborted { tx_id }])?;
        state.apply_aborted(tx_id);
        debug!(tx_id, "aborted transaction");
        Ok(())
    }

    /// Mark a transaction invalid: its writes are poison and stay excluded
    /// from every snapshot until the id is truncated from the invalid
    /// list. Returns true iff state changed.
    pub fn invalidate(&self, tx_id: TxId) -> Result<bool> {
        let mut state = self.state.lock();
        let known = state.in_progress.contains_key(&tx_id)
            || state.committing_change_sets.contains_key(&tx_id);
        if !known {
            return Ok(false);
        }
        state.append(&[TransactionEdit::Invalid { tx_id }])?;
        let changed = state.apply_invalid(tx_id);
        if changed {
            info!(tx_id, invalid_size = state.invalid.len(), "invalidated transaction");
        }
        Ok(changed)
    }

    /// Issue a new write pointer to an existing transaction. The returned
    /// view keeps the original visibility snapshot; only the write pointer
    /// and the checkpoint list change.
    pub fn checkpoint(&self, tx: &Transaction) -> Result<Transaction> {
        let tx_id = tx.transaction_id();
        let mut state = self.state.lock();
        if !state.in_progress.contains_key(&tx_id) {
            return Err(TxError::not_in_progress(tx_id));
        }
        let new_write_pointer = self.next_write_pointer(&state);
        state.append(&[TransactionEdit::Checkpoint {
            tx_id,
            write_pointer: new_write_pointer,
        }])?;
        state.apply_checkpoint(tx_id, new_write_pointer);
        debug!(tx_id, new_write_pointer, "checkpointed transaction");
        Ok(tx.with_checkpoint(new_write_pointer))
    }

    /// Remove the given ids from the invalid list. Returns true iff the
    /// list changed.
    pub fn truncate_invalid_tx(&self, tx_ids: BTreeSet<TxId>) -> Result<bool> {
        let mut state = self.state.lock();
        self.truncate_invalid_locked(&mut state, tx_ids)
    }

    /// Remove all invalid ids whose embedded timestamp is before
    /// `time_millis`. Fails if any in-progress transaction started before
    /// the cutoff.
    pub fn truncate_invalid_tx_before(&self, time_millis: i64) -> Result<bool> {
        if time_millis < 0 {
            return Err(TxError::invalid_argument("truncate time must be >= 0"));
        }
        let cutoff = time_millis as u64 * self.config.max_tx_per_ms;
        let mut state = self.state.lock();
        if let Some((&in_progress_tx, _)) = state.in_progress.range(..cutoff).next() {
            return Err(TxError::InvalidTruncateTime {
                time_millis,
                in_progress_tx,
            });
        }
        let tx_ids: BTreeSet<TxId> = state
            .invalid
            .iter()
            .copied()
            .filter(|&id| id < cutoff)
            .collect();
        self.truncate_invalid_locked(&mut state, tx_ids)
    }

    fn truncate_invalid_locked(
        &self,
        state: &mut ManagerState,
        tx_ids: BTreeSet<TxId>,
    ) -> Result<bool> {
        let to_remove: BTreeSet<TxId> = state
            .invalid
            .iter()
            .copied()
            .filter(|id| tx_ids.contains(id))
            .collect();
        if to_remove.is_empty() {
            return Ok(false);
        }
        state.append(&[TransactionEdit::TruncateInvalidTx {
            tx_ids: to_remove.clone(),
        }])?;
        let changed = state.apply_truncate_invalid(&to_remove);
        info!(
            removed = to_remove.len(),
            invalid_size = state.invalid.len(),
            "truncated invalid list"
        );
        Ok(changed)
    }

    /// Size of the invalid list.
    pub fn invalid_size(&self) -> usize {
        self.state.lock().invalid.len()
    }

    /// Advance the retention horizon of the committed change-sets: any
    /// entry at or below `min(read_pointer, earliest in-progress
    /// visibility bound)` can never cause a new conflict and is dropped.
    /// Pruning is not logged; replay may retain more than the live state.
    pub fn prune_now(&self) {
        let mut state = self.state.lock();
        let min_visibility = state
            .in_progress
            .values()
            .map(|e| e.visibility_upper_bound)
            .min()
            .unwrap_or(TxId::MAX);
        let horizon = state.read_pointer.min(min_visibility);
        let keep = state
            .committed_change_sets
            .split_off(&(horizon.saturating_add(1)));
        let dropped = state.committed_change_sets.len();
        state.committed_change_sets = keep;
        if dropped > 0 {
            debug!(horizon, dropped, "pruned committed change-sets");
        }
    }

    /// Invalidate every expired SHORT transaction. Called by the sweep
    /// thread; public so tests and operators can force a pass.
    pub fn sweep_expired(&self) {
        let now = now_millis();
        let expired: Vec<TxId> = {
            let state = self.state.lock();
            state
                .in_progress
                .iter()
                .filter(|(_, e)| e.tx_type == Some(TransactionType::Short) && e.is_expired_at(now))
                .map(|(&id, _)| id)
                .collect()
        };
        for tx_id in expired {
            match self.invalidate(tx_id) {
                Ok(true) => info!(tx_id, "invalidated expired transaction"),
                Ok(false) => {}
                Err(e) => warn!(tx_id, error = %e, "failed to invalidate expired transaction"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Consistent copy of the current state. Does not mutate anything.
    pub fn snapshot_state(&self) -> TransactionSnapshot {
        let state = self.state.lock();
        state.to_snapshot(now_millis())
    }

    /// Encoded snapshot of the current state, for export over the wire.
    /// Nothing is persisted.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.provider.encode(&self.snapshot_state()))
    }

    /// Write a snapshot to storage and roll the edit log onto a fresh
    /// segment, then apply the retention policies.
    pub fn take_snapshot(&self) -> Result<()> {
        // Under the lock: capture the state and roll the log, so the new
        // segment starts exactly at the snapshot boundary.
        let (snapshot, mut old_log) = {
            let mut state = self.state.lock();
            let ts = now_millis().max(state.log.as_ref().map_or(0, |l| l.timestamp() + 1));
            let snapshot = state.to_snapshot(ts);
            let new_log = self.storage.create_log(ts)?;
            let old_log = state.log.replace(new_log);
            (snapshot, old_log)
        };
        if let Some(log) = old_log.as_mut() {
            log.close()?;
        }

        // Outside the lock: the slow file writes.
        self.storage.write_snapshot(&snapshot)?;
        self.storage.delete_logs_older_than(snapshot.timestamp)?;
        self.storage
            .retain_snapshots(self.config.snapshot_retain_count)?;
        info!(
            timestamp = snapshot.timestamp,
            write_pointer = snapshot.write_pointer,
            "took snapshot"
        );
        Ok(())
    }

    /// Administrative recovery only: blank the entire state and begin a
    /// new epoch at the preserved write pointer, marked by a watermark
    /// edit so replay reproduces the post-reset state.
    pub fn reset_state(&self) -> Result<()> {
        let mut state = self.state.lock();
        let write_pointer = self.next_write_pointer(&state);
        state.append(&[TransactionEdit::MoveWatermark { write_pointer }])?;
        state.apply_move_watermark(write_pointer);
        warn!(write_pointer, "transaction state reset");
        Ok(())
    }

    /// Current read pointer (diagnostics).
    pub fn read_pointer(&self) -> TxId {
        self.state.lock().read_pointer
    }

    /// Current write pointer (diagnostics).
    pub fn write_pointer(&self) -> TxId {
        self.state.lock().write_pointer
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Sleep for `interval` in small slices, returning early (and `true`) when
/// the shutdown flag is raised.
fn sleep_interruptibly(shutdown: &AtomicBool, interval: Duration) -> bool {
    let slice = Duration::from_millis(100);
    let mut remaining = interval;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::SeqCst) {
            return true;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    shutdown.load(Ordering::SeqCst)
}

// ============================================================================
// Tests
// ============================================================================
