/*
 * Copyright (c) 2023-2025, Bib Labs Ltd.
 *
 * This file is part of the Bib Server.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 *
 * You can be released from the requirements of the AGPLv3 license by
 * purchasing a commercial license. Please contact licensing@bib.dev
 * for more details.
*/

use store::log::raft::{Entry, EntryKind, HardState, RaftId};

use super::{open_rocksdb_store, open_sqlite_store};

fn entry(term: u64, tag: u8) -> Entry {
    Entry {
        term,
        kind: EntryKind::Command,
        payload: vec![tag; 8],
    }
}

#[test]
fn log_indices_have_no_gaps() {
    let (_dir, store) = open_rocksdb_store();

    store
        .append_log_entries((1..=20).map(|index| (index, entry(1, index as u8))).collect())
        .unwrap();

    let entries = store.get_log_entries(1, 1000, usize::MAX).unwrap();
    let indices = entries.iter().map(|(index, _)| *index).collect::<Vec<_>>();
    assert_eq!(indices, (1..=20).collect::<Vec<_>>());
    assert_eq!(store.get_last_log_id().unwrap(), Some(RaftId::new(1, 20)));
    assert_eq!(store.get_first_log_index().unwrap(), Some(1));

    // Non-contiguous appends are refused.
    assert!(store
        .append_log_entries(vec![(22, entry(1, 22)), (24, entry(1, 24))])
        .is_err());
}

#[test]
fn conflicting_suffix_is_truncated() {
    let (_dir, store) = open_rocksdb_store();

    store
        .append_log_entries((1..=10).map(|index| (index, entry(1, 0))).collect())
        .unwrap();
    store.truncate_log_from(6).unwrap();

    assert_eq!(store.get_last_log_id().unwrap(), Some(RaftId::new(1, 5)));
    assert!(store.get_log_entry(6).unwrap().is_none());

    // A new leader's entries replace the dropped suffix.
    store
        .append_log_entries((6..=8).map(|index| (index, entry(2, 1))).collect())
        .unwrap();
    assert_eq!(store.get_last_log_id().unwrap(), Some(RaftId::new(2, 8)));
    assert_eq!(store.last_log_id(), RaftId::new(2, 8));
}

#[test]
fn compaction_keeps_the_tail() {
    let (_dir, store) = open_sqlite_store();

    store
        .append_log_entries((1..=50).map(|index| (index, entry(3, 0))).collect())
        .unwrap();
    store.compact_log_up_to(40).unwrap();

    assert_eq!(store.get_first_log_index().unwrap(), Some(41));
    assert_eq!(store.get_last_log_id().unwrap(), Some(RaftId::new(3, 50)));
    let entries = store.get_log_entries(1, 1000, usize::MAX).unwrap();
    assert_eq!(entries.len(), 10);
    assert_eq!(entries[0].0, 41);
}

#[test]
fn entry_batches_respect_size_limits() {
    let (_dir, store) = open_sqlite_store();

    store
        .append_log_entries((1..=30).map(|index| (index, entry(1, 0))).collect())
        .unwrap();

    assert_eq!(store.get_log_entries(1, 5, usize::MAX).unwrap().len(), 5);
    // Byte-capped: each payload is 8 bytes plus encoding overhead.
    assert!(store.get_log_entries(1, 1000, 1).unwrap().len() <= 2);
}

#[test]
fn hard_state_round_trips() {
    let (_dir, store) = open_rocksdb_store();

    assert_eq!(store.get_hard_state().unwrap(), HardState::default());

    let state = HardState {
        current_term: 9,
        voted_for: Some(42),
        commit_index: 17,
    };
    store.set_hard_state(&state).unwrap();
    assert_eq!(store.get_hard_state().unwrap(), state);

    store.set_applied_index(17).unwrap();
    assert_eq!(store.get_applied_index(), 17);
}

#[test]
fn log_position_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let settings = super::init_settings(&dir);

    {
        use store::Store;
        let db = store_sqlite::SqliteStore::open(&settings).unwrap();
        let store = store::BibStore::new(db, &settings).unwrap();
        store
            .append_log_entries((1..=7).map(|index| (index, entry(2, 0))).collect())
            .unwrap();
        store.set_applied_index(7).unwrap();
    }

    use store::Store;
    let db = store_sqlite::SqliteStore::open(&settings).unwrap();
    let store = store::BibStore::new(db, &settings).unwrap();
    assert_eq!(store.last_log_id(), RaftId::new(2, 7));
    assert_eq!(store.get_applied_index(), 7);
}
