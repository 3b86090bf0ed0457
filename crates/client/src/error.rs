//! Failure type for the client-side orchestrator.
//!
//! Participants report failures as boxed errors (or by returning `false`
//! from `persist`/`rollback`); the orchestrator wraps them with the phase
//! they happened in. The retry layer looks at `is_conflict()` only —
//! conflicts are the one recoverable kind.

use keystone_core::{TxError, TxId};
use std::fmt;
use thiserror::Error;

/// Boxed error produced by a participant callback.
pub type ParticipantError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for participant callbacks.
pub type ParticipantResult<T> = std::result::Result<T, ParticipantError>;

/// Lifecycle phase in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    Start,
    UserFunction,
    Checkpoint,
    GetChanges,
    PreCommit,
    Persist,
    Commit,
    PostCommit,
    Rollback,
}

impl fmt::Display for TxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxPhase::Start => "start",
            TxPhase::UserFunction => "user function",
            TxPhase::Checkpoint => "checkpoint",
            TxPhase::GetChanges => "change collection",
            TxPhase::PreCommit => "pre-commit",
            TxPhase::Persist => "persist",
            TxPhase::Commit => "commit",
            TxPhase::PostCommit => "post-commit",
            TxPhase::Rollback => "rollback",
        };
        write!(f, "{name}")
    }
}

/// Failure raised by the transaction orchestrator.
#[derive(Debug, Error)]
pub enum TransactionFailure {
    /// The coordinator rejected the change-set (at pre-commit or commit).
    /// Retryable: a fresh attempt sees a newer snapshot.
    #[error("transaction {tx_id} conflicts with concurrent changes")]
    Conflict {
        /// The conflicted transaction.
        tx_id: TxId,
    },

    /// A participant failed (raised, or returned `false`) in the given
    /// phase.
    #[error("transaction failed in {phase} for participant '{participant}'")]
    Participant {
        /// Phase the failure happened in.
        phase: TxPhase,
        /// Participant name.
        participant: String,
        /// The participant's error, when it raised one (`None` when it
        /// just returned `false`).
        #[source]
        source: Option<ParticipantError>,
    },

    /// The coordinator itself failed.
    #[error("coordinator error in {phase}")]
    Coordinator {
        /// Phase the failure happened in.
        phase: TxPhase,
        /// The underlying coordinator error.
        #[source]
        source: TxError,
    },

    /// Operation not valid for the context's current state, e.g.
    /// finishing a context that was never started or removing a
    /// participant mid-transaction.
    #[error("invalid transaction context state: {0}")]
    IllegalState(String),
}

impl TransactionFailure {
    pub fn participant(
        phase: TxPhase,
        participant: impl Into<String>,
        source: Option<ParticipantError>,
    ) -> Self {
        TransactionFailure::Participant {
            phase,
            participant: participant.into(),
            source,
        }
    }

    pub fn coordinator(phase: TxPhase, source: TxError) -> Self {
        TransactionFailure::Coordinator { phase, source }
    }

    /// Whether retrying the whole unit of work may succeed.
    pub fn is_conflict(&self) -> bool {
        match self {
            TransactionFailure::Conflict { .. } => true,
            TransactionFailure::Coordinator { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_classification() {
        assert!(TransactionFailure::Conflict { tx_id: 1 }.is_conflict());
        assert!(!TransactionFailure::participant(TxPhase::Persist, "ds", None).is_conflict());
        assert!(TransactionFailure::coordinator(
            TxPhase::Commit,
            TxError::Conflict {
                tx_id: 1,
                change: "61".into()
            }
        )
        .is_conflict());
        assert!(
            !TransactionFailure::coordinator(TxPhase::Commit, TxError::not_in_progress(1))
                .is_conflict()
        );
    }

    #[test]
    fn participant_failure_names_phase_and_participant() {
        let failure = TransactionFailure::participant(TxPhase::PostCommit, "hbase", None);
        let msg = failure.to_string();
        assert!(msg.contains("post-commit"));
        assert!(msg.contains("hbase"));
    }
}
