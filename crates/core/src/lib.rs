//! Core types for the Keystone transaction coordinator.
//!
//! This crate is the leaf of the workspace: it defines the identifiers,
//! the client-facing [`Transaction`] visibility view, change ids, the
//! unified error type and the configuration structs. Everything else
//! (durability, the manager, the client orchestrator, the service façade)
//! builds on these types.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use config::{SnapshotConfig, TxConfig};
pub use error::{Result, TxError};
pub use time::now_millis;
pub use types::{
    ChangeId, InProgressTx, Transaction, TransactionType, TxId, MAX_TX_PER_MS, NO_EXPIRATION,
    NO_TX_IN_PROGRESS,
};
