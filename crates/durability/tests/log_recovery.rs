//! Crash-tolerance tests for the edit log: a torn tail must never leak
//! partial groups into replay.

use keystone_core::{ChangeId, TransactionType};
use keystone_durability::{
    EditLogFormat, EditLogReader, EditLogWriter, SyncPolicy, TransactionEdit, TransactionLog,
};
use std::collections::BTreeSet;
use std::path::Path;
use tempfile::TempDir;

/// Deterministic mix of edit kinds, so the reader exercises every decode
/// path during replay.
fn make_edits(count: usize) -> Vec<TransactionEdit> {
    (0..count as u64)
        .map(|i| match i % 5 {
            0 => TransactionEdit::InProgress {
                tx_id: 1_000 + i,
                visibility_upper_bound: 999,
                expiration: if i % 2 == 0 { 1_700_000_000_000 } else { -1 },
                tx_type: if i % 2 == 0 {
                    TransactionType::Short
                } else {
                    TransactionType::Long
                },
            },
            1 => TransactionEdit::CanCommit {
                tx_id: 1_000 + i,
                changes: [ChangeId::new(i.to_le_bytes().to_vec())].into_iter().collect(),
            },
            2 => TransactionEdit::Committed {
                tx_id: 1_000 + i,
                commit_pointer: 2_000 + i,
                changes: [ChangeId::new(i.to_le_bytes().to_vec())].into_iter().collect(),
            },
            3 => TransactionEdit::Aborted { tx_id: 1_000 + i },
            _ => TransactionEdit::Checkpoint {
                tx_id: 1_000 + i,
                write_pointer: 3_000 + i,
            },
        })
        .collect()
}

fn write_in_groups(path: &Path, edits: &[TransactionEdit], group: usize, format: EditLogFormat) {
    let mut writer = EditLogWriter::create(path, 1, format, SyncPolicy::Always).unwrap();
    for chunk in edits.chunks(group) {
        writer.append(chunk).unwrap();
    }
    writer.close().unwrap();
}

/// Byte offset of the last frame in the segment, found by walking the
/// length prefixes from the header.
fn last_frame_offset(bytes: &[u8]) -> usize {
    let mut pos = 5; // magic + version
    loop {
        let len =
            u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        let next = pos + 4 + len;
        if next >= bytes.len() {
            return pos;
        }
        pos = next;
    }
}

#[test]
fn torn_tail_discards_exactly_the_last_group() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("txlog.1");
    let edits = make_edits(2_000);
    write_in_groups(&path, &edits, 5, EditLogFormat::V2);

    // Sanity: intact log replays completely.
    assert_eq!(EditLogReader::read_file(&path).unwrap().len(), 2_000);

    // Corrupt the length bytes of the final record.
    let mut bytes = std::fs::read(&path).unwrap();
    let offset = last_frame_offset(&bytes);
    bytes[offset] = 0xFF;
    bytes[offset + 1] = 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    // The marker announced 5 records but only 4 are intact: the whole
    // trailing group goes, leaving exactly 1,995 edits and a clean EOF.
    let recovered = EditLogReader::read_file(&path).unwrap();
    assert_eq!(recovered.len(), 1_995);
    assert_eq!(recovered[..], edits[..1_995]);
}

#[test]
fn torn_tail_with_group_size_one() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("txlog.1");
    let edits = make_edits(1_000);
    write_in_groups(&path, &edits, 1, EditLogFormat::V2);

    let mut bytes = std::fs::read(&path).unwrap();
    let offset = last_frame_offset(&bytes);
    bytes.truncate(offset + 3);
    std::fs::write(&path, &bytes).unwrap();

    // Only the final single-edit group is lost.
    assert_eq!(EditLogReader::read_file(&path).unwrap().len(), 999);
}

#[test]
fn v1_log_truncates_at_first_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("txlog.1");
    let edits = make_edits(100);
    write_in_groups(&path, &edits, 5, EditLogFormat::V1);

    assert_eq!(EditLogReader::read_file(&path).unwrap().len(), 100);

    let mut bytes = std::fs::read(&path).unwrap();
    let offset = last_frame_offset(&bytes);
    bytes[offset + 6] ^= 0xFF; // payload corruption → checksum mismatch
    std::fs::write(&path, &bytes).unwrap();

    // V1 has no group framing: everything before the bad record survives.
    assert_eq!(EditLogReader::read_file(&path).unwrap().len(), 99);
}

#[test]
fn large_change_sets_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("txlog.1");
    let big: BTreeSet<ChangeId> = (0..500u32)
        .map(|i| ChangeId::new(i.to_le_bytes().to_vec()))
        .collect();
    let edit = TransactionEdit::Committed {
        tx_id: 1,
        commit_pointer: 2,
        changes: big.clone(),
    };

    let mut writer =
        EditLogWriter::create(&path, 1, EditLogFormat::V2, SyncPolicy::Always).unwrap();
    writer.append(std::slice::from_ref(&edit)).unwrap();
    writer.close().unwrap();

    let recovered = EditLogReader::read_file(&path).unwrap();
    assert_eq!(recovered, vec![edit]);
}
