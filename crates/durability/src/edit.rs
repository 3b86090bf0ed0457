//! Edit records — the durable log alphabet.
//!
//! Every state mutation of the transaction manager has exactly one edit
//! type; replaying the edits from an empty state reproduces the state.
//! Edits are encoded as a single type byte followed by type-specific
//! fields, all little-endian:
//!
//! ```text
//! IN_PROGRESS         tx_id(8) visibility_upper_bound(8) expiration(8) type(1)
//! CAN_COMMIT          tx_id(8) change_count(4) [len(4) bytes]*
//! COMMITTED           tx_id(8) commit_pointer(8) change_count(4) [len(4) bytes]*
//! ABORTED             tx_id(8)
//! INVALID             tx_id(8)
//! MOVE_WATERMARK      write_pointer(8)
//! TRUNCATE_INVALID_TX count(4) [tx_id(8)]*
//! CHECKPOINT          tx_id(8) write_pointer(8)
//! ```
//!
//! The type byte uses an explicit mapping table so the durable format is
//! decoupled from enum declaration order.

use crate::wire::{self, Reader, WireError};
use keystone_core::{ChangeId, TransactionType, TxId};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors from encoding or decoding an edit record.
#[derive(Debug, Error)]
pub enum EditCodecError {
    /// Unknown edit type byte.
    #[error("unknown edit type byte 0x{0:02x}")]
    UnknownEditType(u8),

    /// Unknown transaction type byte inside an IN_PROGRESS edit.
    #[error("unknown transaction type byte 0x{0:02x}")]
    UnknownTransactionType(u8),

    /// Truncated or corrupt field data.
    #[error(transparent)]
    Wire(#[from] WireError),
}

// ============================================================================
// Edit type byte table
// ============================================================================

const EDIT_IN_PROGRESS: u8 = 0x01;
const EDIT_CAN_COMMIT: u8 = 0x02;
const EDIT_COMMITTED: u8 = 0x03;
const EDIT_ABORTED: u8 = 0x04;
const EDIT_INVALID: u8 = 0x05;
const EDIT_MOVE_WATERMARK: u8 = 0x06;
const EDIT_TRUNCATE_INVALID_TX: u8 = 0x07;
const EDIT_CHECKPOINT: u8 = 0x08;

// ============================================================================
// TransactionEdit
// ============================================================================

/// A single durable state mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEdit {
    /// A transaction entered the in-progress set.
    InProgress {
        tx_id: TxId,
        visibility_upper_bound: TxId,
        expiration: i64,
        tx_type: TransactionType,
    },
    /// A committing change-set was recorded (pre-commit conflict check
    /// passed). Repeated CAN_COMMIT edits for the same id replace the set.
    CanCommit {
        tx_id: TxId,
        changes: BTreeSet<ChangeId>,
    },
    /// A transaction committed; its changes become visible under
    /// `commit_pointer`.
    Committed {
        tx_id: TxId,
        commit_pointer: TxId,
        changes: BTreeSet<ChangeId>,
    },
    /// A transaction aborted cleanly.
    Aborted { tx_id: TxId },
    /// A transaction was invalidated; its writes are poison.
    Invalid { tx_id: TxId },
    /// Epoch marker: the state was reset and the write pointer advanced
    /// without a new transaction. Replay discards everything before it.
    MoveWatermark { write_pointer: TxId },
    /// Ids were removed from the invalid list.
    TruncateInvalidTx { tx_ids: BTreeSet<TxId> },
    /// An existing transaction received an additional write pointer.
    Checkpoint { tx_id: TxId, write_pointer: TxId },
}

impl TransactionEdit {
    /// Stable type byte for this edit.
    pub fn type_byte(&self) -> u8 {
        match self {
            TransactionEdit::InProgress { .. } => EDIT_IN_PROGRESS,
            TransactionEdit::CanCommit { .. } => EDIT_CAN_COMMIT,
            TransactionEdit::Committed { .. } => EDIT_COMMITTED,
            TransactionEdit::Aborted { .. } => EDIT_ABORTED,
            TransactionEdit::Invalid { .. } => EDIT_INVALID,
            TransactionEdit::MoveWatermark { .. } => EDIT_MOVE_WATERMARK,
            TransactionEdit::TruncateInvalidTx { .. } => EDIT_TRUNCATE_INVALID_TX,
            TransactionEdit::Checkpoint { .. } => EDIT_CHECKPOINT,
        }
    }

    /// Append the encoded edit to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        wire::put_u8(out, self.type_byte());
        match self {
            TransactionEdit::InProgress {
                tx_id,
                visibility_upper_bound,
                expiration,
                tx_type,
            } => {
                wire::put_u64(out, *tx_id);
                wire::put_u64(out, *visibility_upper_bound);
                wire::put_i64(out, *expiration);
                wire::put_u8(out, tx_type.to_byte());
            }
            TransactionEdit::CanCommit { tx_id, changes } => {
                wire::put_u64(out, *tx_id);
                encode_changes(out, changes);
            }
            TransactionEdit::Committed {
                tx_id,
                commit_pointer,
                changes,
            } => {
                wire::put_u64(out, *tx_id);
                wire::put_u64(out, *commit_pointer);
                encode_changes(out, changes);
            }
            TransactionEdit::Aborted { tx_id } | TransactionEdit::Invalid { tx_id } => {
                wire::put_u64(out, *tx_id);
            }
            TransactionEdit::MoveWatermark { write_pointer } => {
                wire::put_u64(out, *write_pointer);
            }
            TransactionEdit::TruncateInvalidTx { tx_ids } => {
                wire::put_u32(out, tx_ids.len() as u32);
                for id in tx_ids {
                    wire::put_u64(out, *id);
                }
            }
            TransactionEdit::Checkpoint {
                tx_id,
                write_pointer,
            } => {
                wire::put_u64(out, *tx_id);
                wire::put_u64(out, *write_pointer);
            }
        }
    }

    /// Encoded form as a standalone buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        self.encode(&mut out);
        out
    }

    /// Decode one edit from the reader, leaving it positioned after the
    /// edit's last field.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, EditCodecError> {
        let type_byte = r.read_u8()?;
        match type_byte {
            EDIT_IN_PROGRESS => {
                let tx_id = r.read_u64()?;
                let visibility_upper_bound = r.read_u64()?;
                let expiration = r.read_i64()?;
                let raw_type = r.read_u8()?;
                let tx_type = TransactionType::from_byte(raw_type)
                    .ok_or(EditCodecError::UnknownTransactionType(raw_type))?;
                Ok(TransactionEdit::InProgress {
                    tx_id,
                    visibility_upper_bound,
                    expiration,
                    tx_type,
                })
            }
            EDIT_CAN_COMMIT => {
                let tx_id = r.read_u64()?;
                let changes = decode_changes(r)?;
                Ok(TransactionEdit::CanCommit { tx_id, changes })
            }
            EDIT_COMMITTED => {
                let tx_id = r.read_u64()?;
                let commit_pointer = r.read_u64()?;
                let changes = decode_changes(r)?;
                Ok(TransactionEdit::Committed {
                    tx_id,
                    commit_pointer,
                    changes,
                })
            }
            EDIT_ABORTED => Ok(TransactionEdit::Aborted {
                tx_id: r.read_u64()?,
            }),
            EDIT_INVALID => Ok(TransactionEdit::Invalid {
                tx_id: r.read_u64()?,
            }),
            EDIT_MOVE_WATERMARK => Ok(TransactionEdit::MoveWatermark {
                write_pointer: r.read_u64()?,
            }),
            EDIT_TRUNCATE_INVALID_TX => {
                let count = r.read_count(8)?;
                let mut tx_ids = BTreeSet::new();
                for _ in 0..count {
                    tx_ids.insert(r.read_u64()?);
                }
                Ok(TransactionEdit::TruncateInvalidTx { tx_ids })
            }
            EDIT_CHECKPOINT => Ok(TransactionEdit::Checkpoint {
                tx_id: r.read_u64()?,
                write_pointer: r.read_u64()?,
            }),
            other => Err(EditCodecError::UnknownEditType(other)),
        }
    }
}

pub(crate) fn encode_changes(out: &mut Vec<u8>, changes: &BTreeSet<ChangeId>) {
    wire::put_u32(out, changes.len() as u32);
    for change in changes {
        wire::put_bytes(out, change.as_bytes());
    }
}

pub(crate) fn decode_changes(r: &mut Reader<'_>) -> Result<BTreeSet<ChangeId>, WireError> {
    let count = r.read_count(4)?;
    let mut changes = BTreeSet::new();
    for _ in 0..count {
        changes.insert(ChangeId::from(r.read_bytes()?));
    }
    Ok(changes)
}

// ============================================================================
// Tests
// ============================================================================
