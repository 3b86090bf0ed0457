//! Transaction lifecycle orchestration.
//!
//! [`TransactionContext`] drives a set of participants through one unit of
//! work:
//!
//! ```text
//! start → (user code mutates participants) → finish
//!   finish = collect changes → can_commit → persist → commit → post_commit
//! ```
//!
//! Failure handling follows a strict escalation ladder:
//!
//! - a failure before anything persisted rolls participants back and
//!   aborts the transaction;
//! - a persist or commit failure rolls back, and if *rollback itself*
//!   fails the transaction is invalidated — its write pointer is poison
//!   and must never become visible;
//! - post-commit failures are reported but never rolled back: the commit
//!   already happened.

use crate::client::TxClient;
use crate::error::{ParticipantError, TransactionFailure, TxPhase};
use crate::participant::TransactionParticipant;
use keystone_core::{ChangeId, Transaction};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Orchestrates one transaction at a time over a set of participants.
pub struct TransactionContext {
    client: Arc<dyn TxClient>,
    participants: Vec<Arc<dyn TransactionParticipant>>,
    current: Option<Transaction>,
    context_id: Uuid,
}

impl TransactionContext {
    pub fn new(
        client: Arc<dyn TxClient>,
        participants: Vec<Arc<dyn TransactionParticipant>>,
    ) -> Self {
        TransactionContext {
            client,
            participants,
            current: None,
            context_id: Uuid::new_v4(),
        }
    }

    /// The transaction currently driven by this context, if any.
    pub fn current_transaction(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    /// Enroll a participant. With a transaction active it receives
    /// `start_tx` immediately. Returns false when the participant is
    /// already enrolled.
    pub fn add_participant(
        &mut self,
        participant: Arc<dyn TransactionParticipant>,
    ) -> Result<bool, TransactionFailure> {
        if self
            .participants
            .iter()
            .any(|p| Arc::ptr_eq(p, &participant))
        {
            return Ok(false);
        }
        if let Some(tx) = &self.current {
            participant.start_tx(tx).map_err(|e| {
                TransactionFailure::participant(TxPhase::Start, participant.name(), Some(e))
            })?;
        }
        self.participants.push(participant);
        Ok(true)
    }

    /// Remove a participant. Not allowed while a transaction is active.
    /// Returns false when the participant was never enrolled.
    pub fn remove_participant(
        &mut self,
        participant: &Arc<dyn TransactionParticipant>,
    ) -> Result<bool, TransactionFailure> {
        if self.current.is_some() {
            return Err(TransactionFailure::IllegalState(
                "cannot remove a participant while a transaction is active".into(),
            ));
        }
        let before = self.participants.len();
        self.participants.retain(|p| !Arc::ptr_eq(p, participant));
        Ok(self.participants.len() != before)
    }

    /// Start a SHORT transaction and distribute it to every participant.
    pub fn start(&mut self) -> Result<&Transaction, TransactionFailure> {
        self.start_with(|client| client.start_short())
    }

    /// Start a SHORT transaction with an explicit timeout.
    pub fn start_with_timeout(&mut self, timeout_secs: u32) -> Result<&Transaction, TransactionFailure> {
        self.start_with(|client| client.start_short_with_timeout(timeout_secs))
    }

    /// Start a LONG transaction.
    pub fn start_long(&mut self) -> Result<&Transaction, TransactionFailure> {
        self.start_with(|client| client.start_long())
    }

    fn start_with(
        &mut self,
        begin: impl FnOnce(&dyn TxClient) -> keystone_core::Result<Transaction>,
    ) -> Result<&Transaction, TransactionFailure> {
        if self.current.is_some() {
            return Err(TransactionFailure::IllegalState(
                "a transaction is already active".into(),
            ));
        }
        let tx = begin(self.client.as_ref())
            .map_err(|e| TransactionFailure::coordinator(TxPhase::Start, e))?;
        debug!(context = %self.context_id, tx_id = tx.transaction_id(), "transaction started");

        for (index, participant) in self.participants.iter().enumerate() {
            if let Err(cause) = participant.start_tx(&tx) {
                let name = participant.name();
                warn!(
                    context = %self.context_id,
                    participant = %name,
                    "participant failed to start, rolling back predecessors"
                );
                // Roll back the participants that did start, then abort.
                let started = self.participants[..index].to_vec();
                self.rollback_participants(&started);
                let _ = self.client.abort(&tx);
                return Err(TransactionFailure::participant(
                    TxPhase::Start,
                    name,
                    Some(cause),
                ));
            }
        }
        self.current = Some(tx);
        Ok(self.current.as_ref().expect("just set"))
    }

    /// Collect changes, run the commit protocol, and finish the
    /// transaction. On success every participant has been persisted and
    /// post-committed.
    pub fn finish(&mut self) -> Result<(), TransactionFailure> {
        let tx = self.current.clone().ok_or_else(|| {
            TransactionFailure::IllegalState("no active transaction to finish".into())
        })?;

        // 1. Collect the union of changes across participants.
        let mut changes: Vec<ChangeId> = Vec::new();
        for participant in self.participants.clone() {
            match participant.tx_changes() {
                Ok(mut c) => changes.append(&mut c),
                Err(cause) => {
                    return self.fail_with_rollback(
                        &tx,
                        TxPhase::GetChanges,
                        participant.name(),
                        Some(cause),
                    );
                }
            }
        }

        // 2. Pre-commit conflict check.
        match self.client.can_commit(&tx, changes) {
            Ok(true) => {}
            Ok(false) => {
                debug!(tx_id = tx.transaction_id(), "pre-commit conflict, rolling back");
                self.rollback_and_terminate(&tx);
                self.current = None;
                return Err(TransactionFailure::Conflict {
                    tx_id: tx.transaction_id(),
                });
            }
            Err(e) => {
                let failure = TransactionFailure::coordinator(TxPhase::PreCommit, e);
                self.rollback_and_terminate(&tx);
                self.current = None;
                return Err(failure);
            }
        }

        // 3. Persist every participant.
        for participant in self.participants.clone() {
            let outcome = participant.persist();
            let cause = match outcome {
                Ok(true) => continue,
                Ok(false) => None,
                Err(e) => Some(e),
            };
            return self.fail_with_rollback(&tx, TxPhase::Persist, participant.name(), cause);
        }

        // 4. Commit.
        match self.client.commit(&tx) {
            Ok(true) => {}
            Ok(false) => {
                debug!(tx_id = tx.transaction_id(), "commit conflict, rolling back");
                self.rollback_and_terminate(&tx);
                self.current = None;
                return Err(TransactionFailure::Conflict {
                    tx_id: tx.transaction_id(),
                });
            }
            Err(e) => {
                let failure = TransactionFailure::coordinator(TxPhase::Commit, e);
                self.rollback_and_terminate(&tx);
                self.current = None;
                return Err(failure);
            }
        }

        // 5. Post-commit. Failures are reported, never rolled back.
        self.current = None;
        let mut post_commit_failure = None;
        for participant in &self.participants {
            if let Err(cause) = participant.post_commit() {
                warn!(
                    participant = %participant.name(),
                    "post-commit failed (not rolled back)"
                );
                post_commit_failure = Some(TransactionFailure::participant(
                    TxPhase::PostCommit,
                    participant.name(),
                    Some(cause),
                ));
            }
        }
        match post_commit_failure {
            None => Ok(()),
            Some(failure) => Err(failure),
        }
    }

    /// Abort the current transaction: roll every participant back, then
    /// abort (or, when rollback fails, invalidate) coordinator-side.
    pub fn abort(&mut self) -> Result<(), TransactionFailure> {
        let Some(tx) = self.current.take() else {
            return Ok(());
        };
        self.rollback_and_terminate(&tx);
        Ok(())
    }

    /// Checkpoint the current transaction and distribute the updated view.
    pub fn checkpoint(&mut self) -> Result<&Transaction, TransactionFailure> {
        let tx = self.current.clone().ok_or_else(|| {
            TransactionFailure::IllegalState("no active transaction to checkpoint".into())
        })?;
        let updated = self
            .client
            .checkpoint(&tx)
            .map_err(|e| TransactionFailure::coordinator(TxPhase::Checkpoint, e))?;
        for participant in &self.participants {
            if let Err(cause) = participant.update_tx(&updated) {
                return Err(TransactionFailure::participant(
                    TxPhase::Checkpoint,
                    participant.name(),
                    Some(cause),
                ));
            }
        }
        self.current = Some(updated);
        Ok(self.current.as_ref().expect("just set"))
    }

    // ------------------------------------------------------------------
    // Failure plumbing
    // ------------------------------------------------------------------

    /// Participant failure path: roll back everything, terminate the
    /// transaction (abort, or invalidate when rollback failed), surface
    /// the participant failure.
    fn fail_with_rollback(
        &mut self,
        tx: &Transaction,
        phase: TxPhase,
        participant: String,
        cause: Option<ParticipantError>,
    ) -> Result<(), TransactionFailure> {
        self.rollback_and_terminate(tx);
        self.current = None;
        Err(TransactionFailure::participant(phase, participant, cause))
    }

    /// Roll back all participants; abort on success, invalidate when any
    /// rollback failed (undo is incomplete, the write pointer is poison).
    fn rollback_and_terminate(&self, tx: &Transaction) {
        let all_rolled_back = self.rollback_participants(&self.participants);
        if all_rolled_back {
            if let Err(e) = self.client.abort(tx) {
                warn!(tx_id = tx.transaction_id(), error = %e, "abort failed");
            }
        } else {
            warn!(
                tx_id = tx.transaction_id(),
                "rollback incomplete, invalidating transaction"
            );
            if let Err(e) = self.client.invalidate(tx.transaction_id()) {
                warn!(tx_id = tx.transaction_id(), error = %e, "invalidate failed");
            }
        }
    }

    /// Roll back the given participants, continuing past failures.
    /// Returns true when every rollback fully succeeded.
    fn rollback_participants(&self, participants: &[Arc<dyn TransactionParticipant>]) -> bool {
        let mut all_ok = true;
        for participant in participants {
            match participant.rollback() {
                Ok(true) => {}
                Ok(false) => {
                    warn!(participant = %participant.name(), "rollback returned false");
                    all_ok = false;
                }
                Err(e) => {
                    warn!(participant = %participant.name(), error = %e, "rollback raised");
                    all_ok = false;
                }
            }
        }
        all_ok
    }
}
