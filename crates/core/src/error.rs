//! Error types for the Keystone coordinator.
//!
//! One unified error enum covers the coordinator core. The variants map the
//! abstract error kinds of the protocol: invalid-argument, not-in-progress,
//! conflict, invalid-truncate-time, snapshot-failure and log-failure. The
//! client orchestrator has its own wrapper (`TransactionFailure` in
//! `keystone-client`) that carries participant causes.
//!
//! Classification helpers (`is_conflict`, `is_retryable`) exist so retry
//! loops can inspect the kind instead of matching variants everywhere.

use crate::types::TxId;
use std::io;
use thiserror::Error;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, TxError>;

/// Error type for coordinator operations.
#[derive(Debug, Error)]
pub enum TxError {
    /// A caller-supplied argument is out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The named transaction is not in the in-progress set. It may have
    /// been aborted, invalidated (e.g. after timing out), or never existed.
    #[error("transaction {tx_id} is not in progress")]
    NotInProgress {
        /// Id the operation named.
        tx_id: TxId,
    },

    /// A committed change-set intersects the proposed changes. Recoverable
    /// by aborting and retrying the whole transaction.
    #[error("transaction {tx_id} conflicts with committed change {change}")]
    Conflict {
        /// The conflicting transaction.
        tx_id: TxId,
        /// Hex rendering of the first conflicting change id.
        change: String,
    },

    /// `truncate_invalid_tx_before` found an in-progress transaction older
    /// than the requested cutoff.
    #[error(
        "cannot truncate invalid list before {time_millis}: \
         transaction {in_progress_tx} is still in progress"
    )]
    InvalidTruncateTime {
        /// Requested cutoff (wall-clock millis).
        time_millis: i64,
        /// An in-progress id below the cutoff.
        in_progress_tx: TxId,
    },

    /// I/O or codec failure while exporting or reading a snapshot.
    #[error("snapshot failure: {message}")]
    SnapshotFailure {
        /// What went wrong.
        message: String,
        /// Underlying error, when one exists.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O failure while appending to or reading the edit log.
    #[error("edit log failure: {message}")]
    LogFailure {
        /// What went wrong.
        message: String,
        /// Underlying error, when one exists.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl TxError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        TxError::InvalidArgument(message.into())
    }

    pub fn not_in_progress(tx_id: TxId) -> Self {
        TxError::NotInProgress { tx_id }
    }

    pub fn snapshot_failure(message: impl Into<String>) -> Self {
        TxError::SnapshotFailure {
            message: message.into(),
            source: None,
        }
    }

    pub fn snapshot_failure_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        TxError::SnapshotFailure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn log_failure(message: impl Into<String>) -> Self {
        TxError::LogFailure {
            message: message.into(),
            source: None,
        }
    }

    pub fn log_failure_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        TxError::LogFailure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this error is a write-write conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, TxError::Conflict { .. })
    }

    /// Whether retrying the whole transaction may succeed. Only conflicts
    /// qualify; everything else needs operator or caller intervention.
    pub fn is_retryable(&self) -> bool {
        self.is_conflict()
    }
}

impl From<io::Error> for TxError {
    fn from(e: io::Error) -> Self {
        TxError::log_failure_with_source("io error", e)
    }
}
