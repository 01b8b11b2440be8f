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

use store::log::raft::{Entry, LogIndex, RaftId, TermId};
use store::Store;

use super::Cluster;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AppendEntriesRequest {
    pub leader_id: super::NodeId,
    pub prev_log: RaftId,
    pub entries: Vec<(LogIndex, Entry)>,
    pub commit_index: LogIndex,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AppendEntriesResponse {
    pub term: TermId,
    pub success: bool,
    /// On success: the last index stored by the follower. On failure: a
    /// hint for the leader's next attempt (`next_index = match_index + 1`).
    pub match_index: LogIndex,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstallSnapshotRequest {
    pub leader_id: super::NodeId,
    pub last_included: RaftId,
    pub configuration: Vec<u8>,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: TermId,
    pub success: bool,
    /// Next byte offset the follower expects.
    pub offset: u64,
}

impl<T> Cluster<T>
where
    T: for<'x> Store<'x> + 'static,
{
    /// Raft log-completeness rule: a higher last term wins; at equal terms,
    /// the longer log wins.
    pub fn log_is_behind_or_eq(&self, last_log_term: TermId, last_log_index: LogIndex) -> bool {
        last_log_term > self.last_log.term
            || (last_log_term == self.last_log.term && last_log_index >= self.last_log.index)
    }

    pub fn log_is_behind(&self, last_log_term: TermId, last_log_index: LogIndex) -> bool {
        last_log_term > self.last_log.term
            || (last_log_term == self.last_log.term && last_log_index > self.last_log.index)
    }

    /// Whether the follower's log matches `prev_log`, consulting the latest
    /// snapshot for entries that were compacted away.
    pub fn matches_prev_log(&self, prev_log: &RaftId, local: Option<Entry>) -> bool {
        if prev_log.index == 0 {
            true
        } else if let Some(entry) = local {
            entry.term == prev_log.term
        } else {
            *prev_log == self.last_snapshot
        }
    }
}
