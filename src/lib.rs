//! Keystone — a distributed transaction coordinator.
//!
//! Keystone provides optimistic multi-version concurrency control (MVCC)
//! with snapshot isolation across independent participant resources. The
//! coordinator stores no user data: participants own their data and are
//! told which version of history to read and which commit identifier to
//! stamp writes with.
//!
//! ## Crates
//!
//! - [`keystone_core`] — identifiers, the `Transaction` visibility view,
//!   change ids, errors, configuration
//! - [`keystone_durability`] — edit log, snapshots, versioned codecs,
//!   state storage
//! - [`keystone_concurrency`] — the `TransactionManager` state machine
//! - [`keystone_client`] — participant lifecycle orchestration and retry
//! - [`keystone_service`] — request dispatch façade
//!
//! ## Quick start (embedded coordinator)
//!
//! ```ignore
//! use keystone::prelude::*;
//!
//! let storage = Arc::new(InMemoryTxStorage::new());
//! let manager = Arc::new(TransactionManager::new(TxConfig::default(), storage));
//! manager.start()?;
//!
//! let tx = manager.start_short(None)?;
//! let ok = manager.can_commit(&tx, changes)?;
//! assert!(ok && manager.commit(&tx)?);
//! ```

pub use keystone_client as client;
pub use keystone_concurrency as concurrency;
pub use keystone_core as core;
pub use keystone_durability as durability;
pub use keystone_service as service;

/// Commonly used types, re-exported for embedding.
pub mod prelude {
    pub use keystone_client::{
        InMemoryTxClient, RetryStrategies, TransactionContext, TransactionExecutor,
        TransactionParticipant, TxClient,
    };
    pub use keystone_concurrency::TransactionManager;
    pub use keystone_core::{
        ChangeId, SnapshotConfig, Transaction, TransactionType, TxConfig, TxError, TxId,
    };
    pub use keystone_durability::{InMemoryTxStorage, LocalFileTxStorage, TxStateStorage};
    pub use keystone_service::TransactionService;
}
