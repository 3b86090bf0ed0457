//! The participant capability set.
//!
//! A participant is any resource that buffers writes under a transaction's
//! write pointer and can persist or undo them on demand. The coordinator
//! never sees participant data — only the change ids it reports.
//!
//! Callbacks take `&self`: participants are shared between the user's code
//! (which feeds them data) and the orchestrator (which drives the
//! lifecycle), so interior mutability is the implementor's job.

use crate::error::ParticipantResult;
use keystone_core::{ChangeId, Transaction};

/// A resource enrolled in a distributed transaction.
pub trait TransactionParticipant: Send + Sync {
    /// Name for diagnostics and failure reports.
    fn name(&self) -> String;

    /// A new transaction began; later reads/writes run under `tx`.
    fn start_tx(&self, tx: &Transaction) -> ParticipantResult<()>;

    /// The transaction checkpointed; subsequent writes are stamped with
    /// the updated write pointer.
    fn update_tx(&self, tx: &Transaction) -> ParticipantResult<()>;

    /// Change ids of everything this participant wrote in the current
    /// transaction. Called before the pre-commit conflict check; the set
    /// must not grow afterwards.
    fn tx_changes(&self) -> ParticipantResult<Vec<ChangeId>>;

    /// Make buffered writes durable in the participant's own store.
    /// Returns `Ok(false)` to signal failure without an error value.
    fn persist(&self) -> ParticipantResult<bool>;

    /// Undo buffered (and possibly persisted) writes. Returns `Ok(false)`
    /// when the undo could not be completed — the orchestrator then
    /// invalidates the transaction instead of aborting it.
    fn rollback(&self) -> ParticipantResult<bool>;

    /// The transaction committed; release buffers, advance caches. Errors
    /// here are reported but never roll anything back.
    fn post_commit(&self) -> ParticipantResult<()>;
}
