//! Durability subsystem for the Keystone transaction coordinator.
//!
//! Three layers, leaves first:
//!
//! 1. **Edit records** ([`edit`]) — one typed record per manager state
//!    mutation, with a versioned binary encoding.
//! 2. **Edit log** ([`log`]) — append-only segment files with commit-marker
//!    group framing, CRC-protected frames, batched group commit, and a
//!    reader that tolerates torn tails.
//! 3. **Snapshots** ([`snapshot`], [`codec`]) and **storage** ([`storage`])
//!    — full-state dumps with a forward-readable visibility prefix,
//!    versioned codecs behind a provider registry, and the filesystem
//!    layout tying snapshots and log segments together.
//!
//! Crash recovery is driven by the manager: decode the newest snapshot,
//! replay every segment from that epoch forward, discard older segments.

pub mod codec;
pub mod edit;
pub mod log;
pub mod snapshot;
pub mod storage;
pub mod wire;

pub use codec::{
    SnapshotCodec, SnapshotCodecProvider, SnapshotCodecV1, SnapshotCodecV2, SnapshotError,
    SNAPSHOT_MAGIC,
};
pub use edit::{EditCodecError, TransactionEdit};
pub use log::{
    EditLogFormat, EditLogReader, EditLogWriter, LogError, SyncPolicy, TransactionLog, LOG_MAGIC,
};
pub use snapshot::{TransactionSnapshot, TransactionVisibilityState};
pub use storage::{InMemoryTxStorage, LocalFileTxStorage, TxStateStorage};
