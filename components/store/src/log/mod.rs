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

pub mod raft;
pub mod snapshot;

use std::sync::atomic::Ordering;

use crate::serialize::key::{LogKey, SystemKey};
use crate::serialize::{StoreDeserialize, StoreSerialize};
use crate::{BibStore, Direction, Store, StoreError, Table, WriteOperation};

use self::raft::{Entry, HardState, LogIndex, RaftId};

impl<T> BibStore<T>
where
    T: for<'x> Store<'x> + 'static,
{
    /// Appends a contiguous run of entries. The first index must follow the
    /// last stored index unless the log is being overwritten after a
    /// conflict truncation.
    pub fn append_log_entries(&self, entries: Vec<(LogIndex, Entry)>) -> crate::Result<()> {
        let mut batch = Vec::with_capacity(entries.len());
        let mut last: Option<RaftId> = None;

        for (index, entry) in entries {
            if index == 0 {
                return Err(StoreError::InvalidArguments(
                    "Log index 0 is reserved.".to_string(),
                ));
            }
            if let Some(prev) = &last {
                if index != prev.index + 1 {
                    return Err(StoreError::InvalidArguments(format!(
                        "Non-contiguous log append: {} after {}.",
                        index, prev.index
                    )));
                }
            }
            last = RaftId::new(entry.term, index).into();
            batch.push(WriteOperation::set(
                Table::Logs,
                LogKey::serialize_entry(index),
                entry.serialize().ok_or_else(|| {
                    StoreError::SerializeError("Failed to serialize log entry.".to_string())
                })?,
            ));
        }

        if let Some(last) = last {
            self.db.write(batch)?;
            self.raft_term.store(last.term, Ordering::Release);
            self.raft_index.store(last.index, Ordering::Release);
        }
        Ok(())
    }

    pub fn get_log_entry(&self, index: LogIndex) -> crate::Result<Option<Entry>> {
        self.db.get(Table::Logs, &LogKey::serialize_entry(index))
    }

    /// Returns up to `max_entries` entries starting at `from`, stopping
    /// early once `max_bytes` of payload has been collected.
    pub fn get_log_entries(
        &self,
        from: LogIndex,
        max_entries: usize,
        max_bytes: usize,
    ) -> crate::Result<Vec<(LogIndex, Entry)>> {
        let mut entries = Vec::new();
        let mut bytes = 0;
        let start = LogKey::serialize_entry(from);

        for (key, value) in self
            .db
            .iterator(Table::Logs, &start, Direction::Forward)?
        {
            let index = match LogKey::deserialize_entry(&key) {
                Some(index) => index,
                None => break,
            };
            let entry = Entry::deserialize(&value).ok_or_else(|| {
                StoreError::DataCorruption(format!("Corrupted log entry {}.", index))
            })?;
            bytes += value.len();
            entries.push((index, entry));
            if entries.len() >= max_entries || bytes >= max_bytes {
                break;
            }
        }

        Ok(entries)
    }

    pub fn get_last_log_id(&self) -> crate::Result<Option<RaftId>> {
        let start = LogKey::serialize_entry(LogIndex::MAX);

        if let Some((key, value)) = self
            .db
            .iterator(Table::Logs, &start, Direction::Backward)?
            .next()
        {
            if let Some(index) = LogKey::deserialize_entry(&key) {
                let entry = Entry::deserialize(&value).ok_or_else(|| {
                    StoreError::DataCorruption(format!("Corrupted log entry {}.", index))
                })?;
                return Ok(Some(RaftId::new(entry.term, index)));
            }
        }
        Ok(None)
    }

    pub fn get_first_log_index(&self) -> crate::Result<Option<LogIndex>> {
        let start = LogKey::serialize_entry(0);

        if let Some((key, _)) = self
            .db
            .iterator(Table::Logs, &start, Direction::Forward)?
            .next()
        {
            return Ok(LogKey::deserialize_entry(&key));
        }
        Ok(None)
    }

    /// Deletes every entry with `index >= from`. Used to drop a conflicting
    /// suffix before appending the leader's entries.
    pub fn truncate_log_from(&self, from: LogIndex) -> crate::Result<()> {
        let start = LogKey::serialize_entry(from);
        let mut batch = Vec::new();

        for (key, _) in self
            .db
            .iterator(Table::Logs, &start, Direction::Forward)?
        {
            if LogKey::deserialize_entry(&key).is_none() {
                break;
            }
            batch.push(WriteOperation::Delete {
                table: Table::Logs,
                key: key.to_vec(),
            });
        }

        if !batch.is_empty() {
            self.db.write(batch)?;
        }

        let last = self.get_last_log_id()?.unwrap_or_else(RaftId::none);
        self.raft_term.store(last.term, Ordering::Release);
        self.raft_index.store(last.index, Ordering::Release);
        Ok(())
    }

    /// Deletes every entry with `index <= up_to`. Only entries behind the
    /// latest snapshot may be compacted away.
    pub fn compact_log_up_to(&self, up_to: LogIndex) -> crate::Result<()> {
        let start = LogKey::serialize_entry(0);
        let mut batch = Vec::new();

        for (key, _) in self
            .db
            .iterator(Table::Logs, &start, Direction::Forward)?
        {
            match LogKey::deserialize_entry(&key) {
                Some(index) if index <= up_to => {
                    batch.push(WriteOperation::Delete {
                        table: Table::Logs,
                        key: key.to_vec(),
                    });
                }
                _ => break,
            }
        }

        if !batch.is_empty() {
            self.db.write(batch)?;
            self.db.compact(Table::Logs)?;
        }
        Ok(())
    }

    pub fn set_hard_state(&self, state: &HardState) -> crate::Result<()> {
        self.db.set(
            Table::System,
            SystemKey::HARD_STATE,
            &state.serialize().ok_or_else(|| {
                StoreError::SerializeError("Failed to serialize hard state.".to_string())
            })?,
        )
    }

    pub fn get_hard_state(&self) -> crate::Result<HardState> {
        Ok(self
            .db
            .get(Table::System, SystemKey::HARD_STATE)?
            .unwrap_or_default())
    }

    pub fn set_applied_index(&self, index: LogIndex) -> crate::Result<()> {
        self.db
            .set(Table::System, SystemKey::APPLIED_INDEX, &index.to_be_bytes())?;
        self.applied_index.store(index, Ordering::Release);
        Ok(())
    }

    pub fn get_applied_index(&self) -> LogIndex {
        self.applied_index.load(Ordering::Acquire)
    }

    pub fn last_log_id(&self) -> RaftId {
        RaftId::new(
            self.raft_term.load(Ordering::Acquire),
            self.raft_index.load(Ordering::Acquire),
        )
    }
}
