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

use crate::serialize::leb128::{Leb128Iterator, Leb128Vec};
use crate::serialize::{StoreDeserialize, StoreSerialize};

pub type TermId = u64;
pub type LogIndex = u64;
pub type NodeId = u64;

/// Index 0 is reserved: the log starts at index 1, so `index == 0` means
/// "no entry".
#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RaftId {
    pub term: TermId,
    pub index: LogIndex,
}

impl RaftId {
    pub fn new(term: TermId, index: LogIndex) -> Self {
        Self { term, index }
    }

    pub fn none() -> Self {
        Self { term: 0, index: 0 }
    }

    pub fn is_none(&self) -> bool {
        self.index == 0
    }
}

impl StoreSerialize for RaftId {
    fn serialize(&self) -> Option<Vec<u8>> {
        let mut bytes = Vec::with_capacity(std::mem::size_of::<RaftId>());
        bytes.push_leb128(self.term);
        bytes.push_leb128(self.index);
        bytes.into()
    }
}

impl StoreDeserialize for RaftId {
    fn deserialize(bytes: &[u8]) -> Option<Self> {
        let mut bytes = bytes.iter();
        Some(Self {
            term: bytes.next_leb128()?,
            index: bytes.next_leb128()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntryKind {
    Command,
    Configuration,
    Noop,
}

/// A single replicated log entry. The index is the storage key and is not
/// repeated in the value.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Entry {
    pub term: TermId,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn noop(term: TermId) -> Self {
        Entry {
            term,
            kind: EntryKind::Noop,
            payload: Vec::new(),
        }
    }
}

impl StoreSerialize for Entry {
    fn serialize(&self) -> Option<Vec<u8>> {
        bincode::serialize(self).ok()
    }
}

impl StoreDeserialize for Entry {
    fn deserialize(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

/// Election-safety state, persisted before any RPC answer that could
/// invalidate a previous promise.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HardState {
    pub current_term: TermId,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
}

impl StoreSerialize for HardState {
    fn serialize(&self) -> Option<Vec<u8>> {
        bincode::serialize(self).ok()
    }
}

impl StoreDeserialize for HardState {
    fn deserialize(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}
