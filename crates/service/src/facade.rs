//! Request dispatch over the transaction manager.
//!
//! The façade is deliberately thin: one request kind per manager
//! operation, no additional semantics. An RPC server deserializes its
//! wire format into [`TxRequest`], calls [`TransactionService::dispatch`],
//! and serializes the [`TxResponse`] (or the typed error) back out. The
//! wire format itself is out of scope here.

use keystone_concurrency::TransactionManager;
use keystone_core::{ChangeId, Result, Transaction, TxId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

/// One coordinator operation, as named by the wire layer.
#[derive(Debug, Clone)]
pub enum TxRequest {
    StartShort,
    StartShortTimeout { timeout_secs: u32 },
    StartLong,
    CanCommit { tx: Transaction, changes: Vec<ChangeId> },
    Commit { tx: Transaction },
    Abort { tx: Transaction },
    Invalidate { tx_id: TxId },
    Checkpoint { tx: Transaction },
    TruncateInvalidTx { tx_ids: BTreeSet<TxId> },
    TruncateInvalidTxBefore { time_millis: i64 },
    GetInvalidSize,
    PruneNow,
    ResetState,
    Status,
    Snapshot,
}

/// The matching reply for each request kind.
#[derive(Debug, Clone)]
pub enum TxResponse {
    Started(Transaction),
    CanCommit(bool),
    Committed(bool),
    Aborted,
    Invalidated(bool),
    Checkpointed(Transaction),
    Truncated(bool),
    InvalidSize(usize),
    Done,
    Status(String),
    Snapshot(Vec<u8>),
}

/// Thin service façade over a shared [`TransactionManager`].
pub struct TransactionService {
    manager: Arc<TransactionManager>,
}

impl TransactionService {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        TransactionService { manager }
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Translate one request into one manager operation.
    pub fn dispatch(&self, request: TxRequest) -> Result<TxResponse> {
        trace!(?request, "dispatching");
        match request {
            TxRequest::StartShort => Ok(TxResponse::Started(self.manager.start_short(None)?)),
            TxRequest::StartShortTimeout { timeout_secs } => Ok(TxResponse::Started(
                self.manager.start_short(Some(timeout_secs))?,
            )),
            TxRequest::StartLong => Ok(TxResponse::Started(self.manager.start_long()?)),
            TxRequest::CanCommit { tx, changes } => Ok(TxResponse::CanCommit(
                self.manager.can_commit(&tx, changes)?,
            )),
            TxRequest::Commit { tx } => Ok(TxResponse::Committed(self.manager.commit(&tx)?)),
            TxRequest::Abort { tx } => {
                self.manager.abort(&tx)?;
                Ok(TxResponse::Aborted)
            }
            TxRequest::Invalidate { tx_id } => {
                Ok(TxResponse::Invalidated(self.manager.invalidate(tx_id)?))
            }
            TxRequest::Checkpoint { tx } => {
                Ok(TxResponse::Checkpointed(self.manager.checkpoint(&tx)?))
            }
            TxRequest::TruncateInvalidTx { tx_ids } => Ok(TxResponse::Truncated(
                self.manager.truncate_invalid_tx(tx_ids)?,
            )),
            TxRequest::TruncateInvalidTxBefore { time_millis } => Ok(TxResponse::Truncated(
                self.manager.truncate_invalid_tx_before(time_millis)?,
            )),
            TxRequest::GetInvalidSize => {
                Ok(TxResponse::InvalidSize(self.manager.invalid_size()))
            }
            TxRequest::PruneNow => {
                self.manager.prune_now();
                Ok(TxResponse::Done)
            }
            TxRequest::ResetState => {
                self.manager.reset_state()?;
                Ok(TxResponse::Done)
            }
            TxRequest::Status => Ok(TxResponse::Status(self.manager.status())),
            TxRequest::Snapshot => Ok(TxResponse::Snapshot(self.manager.snapshot_bytes()?)),
        }
    }
}
