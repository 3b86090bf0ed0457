//! Client-side interface to the transaction coordinator.
//!
//! [`TxClient`] mirrors the coordinator's operation set one-for-one; the
//! orchestrator and executor are written against it so they work the same
//! whether the coordinator is embedded in-process or behind an RPC stub.
//! [`InMemoryTxClient`] is the embedded flavor, delegating straight to a
//! shared [`TransactionManager`].

use keystone_concurrency::TransactionManager;
use keystone_core::{ChangeId, Result, Transaction, TxId};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Operations a client can invoke on the coordinator.
pub trait TxClient: Send + Sync {
    /// Start a SHORT transaction with the default timeout.
    fn start_short(&self) -> Result<Transaction>;

    /// Start a SHORT transaction with an explicit timeout (seconds).
    fn start_short_with_timeout(&self, timeout_secs: u32) -> Result<Transaction>;

    /// Start a LONG transaction.
    fn start_long(&self) -> Result<Transaction>;

    /// Pre-commit conflict check; records the change-set. `Ok(false)`
    /// means conflict.
    fn can_commit(&self, tx: &Transaction, changes: Vec<ChangeId>) -> Result<bool>;

    /// Commit; `Ok(false)` means a conflict was detected and the caller
    /// must abort.
    fn commit(&self, tx: &Transaction) -> Result<bool>;

    /// Abort; idempotent, silent on expired transactions.
    fn abort(&self, tx: &Transaction) -> Result<()>;

    /// Invalidate a transaction by id; true iff state changed.
    fn invalidate(&self, tx_id: TxId) -> Result<bool>;

    /// Issue a new write pointer to the transaction.
    fn checkpoint(&self, tx: &Transaction) -> Result<Transaction>;

    /// Remove the ids from the invalid list; true iff it changed.
    fn truncate_invalid_tx(&self, tx_ids: BTreeSet<TxId>) -> Result<bool>;

    /// Remove invalid ids started before the cutoff; true iff changed.
    fn truncate_invalid_tx_before(&self, time_millis: i64) -> Result<bool>;

    /// Size of the invalid list.
    fn invalid_size(&self) -> Result<usize>;

    /// Trigger change-set pruning now.
    fn prune_now(&self) -> Result<()>;

    /// Administrative state reset.
    fn reset_state(&self) -> Result<()>;

    /// Coordinator status string.
    fn status(&self) -> Result<String>;

    /// Encoded snapshot of the coordinator state (not persisted).
    fn snapshot_bytes(&self) -> Result<Vec<u8>>;
}

/// Embedded client: every call goes straight into a shared manager.
pub struct InMemoryTxClient {
    manager: Arc<TransactionManager>,
}

impl InMemoryTxClient {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        InMemoryTxClient { manager }
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }
}

impl TxClient for InMemoryTxClient {
    fn start_short(&self) -> Result<Transaction> {
        self.manager.start_short(None)
    }

    fn start_short_with_timeout(&self, timeout_secs: u32) -> Result<Transaction> {
        self.manager.start_short(Some(timeout_secs))
    }

    fn start_long(&self) -> Result<Transaction> {
        self.manager.start_long()
    }

    fn can_commit(&self, tx: &Transaction, changes: Vec<ChangeId>) -> Result<bool> {
        self.manager.can_commit(tx, changes)
    }

    fn commit(&self, tx: &Transaction) -> Result<bool> {
        self.manager.commit(tx)
    }

    fn abort(&self, tx: &Transaction) -> Result<()> {
        self.manager.abort(tx)
    }

    fn invalidate(&self, tx_id: TxId) -> Result<bool> {
        self.manager.invalidate(tx_id)
    }

    fn checkpoint(&self, tx: &Transaction) -> Result<Transaction> {
        self.manager.checkpoint(tx)
    }

    fn truncate_invalid_tx(&self, tx_ids: BTreeSet<TxId>) -> Result<bool> {
        self.manager.truncate_invalid_tx(tx_ids)
    }

    fn truncate_invalid_tx_before(&self, time_millis: i64) -> Result<bool> {
        self.manager.truncate_invalid_tx_before(time_millis)
    }

    fn invalid_size(&self) -> Result<usize> {
        Ok(self.manager.invalid_size())
    }

    fn prune_now(&self) -> Result<()> {
        self.manager.prune_now();
        Ok(())
    }

    fn reset_state(&self) -> Result<()> {
        self.manager.reset_state()
    }

    fn status(&self) -> Result<String> {
        Ok(self.manager.status())
    }

    fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        self.manager.snapshot_bytes()
    }
}
