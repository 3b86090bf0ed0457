//! Transaction manager for the Keystone coordinator.
//!
//! [`TransactionManager`] is the in-memory state machine behind every
//! coordinator operation: id allocation, in-progress tracking, write-write
//! conflict detection, the invalid list, checkpointing, snapshot export,
//! crash recovery and pruning. All transitions are serialized behind one
//! lock and made durable through the edit log before they apply.

pub mod conflict;
pub mod manager;

pub use conflict::find_conflict;
pub use manager::{restore_in_progress_types, TransactionManager};
