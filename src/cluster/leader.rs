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

use super::log::{AppendEntriesRequest, AppendEntriesResponse};
use super::rpc::Request;
use super::{Cluster, State, RAFT_LOG_LEADER};
use std::sync::atomic::Ordering;
use store::log::raft::{Entry, LogIndex, NodeId, RaftId};
use store::tracing::{debug, info};
use store::Store;

impl<T> Cluster<T>
where
    T: for<'x> Store<'x> + 'static,
{
    pub async fn become_leader(&mut self) -> store::Result<()> {
        info!(
            "[{}] This node is the new leader for term {}.",
            self.addr, self.term
        );

        self.state = State::Leader;
        let next_index = self.last_log.index + 1;
        for peer in self.peers.iter_mut() {
            peer.next_index = next_index;
            peer.match_index = 0;
            peer.installing = None;
            peer.vote_granted = false;
        }

        if let Some(ipc) = &self.core.cluster {
            ipc.state.store(RAFT_LOG_LEADER, Ordering::Relaxed);
        }
        self.set_leader(Some(self.node_id)).await;

        // A no-op entry for the new term: older entries become committed
        // transitively once this one does.
        self.append_entries(vec![Entry::noop(self.term)]).await?;
        if self.bootstrap {
            self.ensure_self_member().await?;
        }
        self.send_append_entries().await?;
        self.try_advance_commit_index().await?;

        Ok(())
    }

    /// Appends entries to the local log, assigning consecutive indexes
    /// starting after the current tail.
    pub async fn append_entries(&mut self, entries: Vec<Entry>) -> store::Result<LogIndex> {
        let mut index = self.last_log.index;
        let mut term = self.last_log.term;
        let entries = entries
            .into_iter()
            .map(|entry| {
                index += 1;
                term = entry.term;
                (index, entry)
            })
            .collect::<Vec<_>>();

        let store = self.core.store.clone();
        self.core
            .spawn_worker(move || store.append_log_entries(entries))
            .await?;
        self.last_log = RaftId::new(term, index);
        Ok(index)
    }

    /// Ships the next batch to every reachable follower; followers that
    /// fell behind the compacted log get a snapshot stream instead.
    pub async fn send_append_entries(&mut self) -> store::Result<()> {
        if !self.is_leading() {
            return Ok(());
        }

        let term = self.term;
        let commit_index = self.commit_index;
        let leader_id = self.node_id;
        let max_entries = self.config.max_append_entries;
        let max_bytes = self.config.max_append_bytes;
        let last_log = self.last_log;
        let last_snapshot = self.last_snapshot;

        // Plan first: the log reads below must not hold a borrow on the
        // peer table.
        let plan = self
            .peers
            .iter()
            .filter(|peer| peer.is_online() && peer.installing.is_none())
            .map(|peer| (peer.node_id, peer.next_index))
            .collect::<Vec<_>>();

        let mut snapshot_targets = Vec::new();
        for (node_id, next_index) in plan {
            if next_index <= last_snapshot.index && last_snapshot.index > 0 {
                snapshot_targets.push(node_id);
                continue;
            }

            let prev_index = next_index - 1;
            let prev_log = if prev_index == 0 {
                RaftId::none()
            } else if prev_index == last_snapshot.index {
                last_snapshot
            } else if prev_index == last_log.index {
                last_log
            } else {
                let store = self.core.store.clone();
                let term = self
                    .core
                    .spawn_worker(move || store.get_log_entry(prev_index))
                    .await?
                    .map(|entry| entry.term);
                match term {
                    Some(term) => RaftId::new(term, prev_index),
                    None => {
                        // Compacted away since the check above.
                        snapshot_targets.push(node_id);
                        continue;
                    }
                }
            };

            let entries = if next_index <= last_log.index {
                let store = self.core.store.clone();
                self.core
                    .spawn_worker(move || store.get_log_entries(next_index, max_entries, max_bytes))
                    .await?
            } else {
                Vec::new()
            };

            if let Some(peer) = self.get_peer(node_id) {
                peer.dispatch_request(Request::AppendEntries {
                    term,
                    request: AppendEntriesRequest {
                        leader_id,
                        prev_log,
                        entries,
                        commit_index,
                    },
                })
                .await;
            }
        }

        for node_id in snapshot_targets {
            self.start_snapshot_install(node_id).await?;
        }

        Ok(())
    }

    pub async fn handle_append_entries_response(
        &mut self,
        node_id: NodeId,
        response: AppendEntriesResponse,
    ) -> store::Result<()> {
        if response.term > self.term {
            self.step_down(response.term).await?;
            return Ok(());
        }
        if !self.is_leading() || response.term != self.term {
            return Ok(());
        }

        let last_log_index = self.last_log.index;
        let more = {
            let peer = match self.get_peer_mut(node_id) {
                Some(peer) => peer,
                None => return Ok(()),
            };
            if response.success {
                peer.match_index = response.match_index;
                peer.next_index = response.match_index + 1;
            } else {
                debug!(
                    "Follower {} rejected append at {}, retrying from {}.",
                    node_id,
                    peer.next_index,
                    response.match_index + 1
                );
                peer.next_index = std::cmp::max(1, response.match_index + 1);
            }
            peer.next_index <= last_log_index || !response.success
        };

        self.try_advance_commit_index().await?;

        if more {
            self.send_append_entries().await?;
        }
        Ok(())
    }

    /// Advances `commit_index` to the highest index stored on a majority of
    /// voters, counting only entries from the current term.
    pub async fn try_advance_commit_index(&mut self) -> store::Result<()> {
        if !self.is_leading() {
            return Ok(());
        }

        let mut match_indexes = Vec::with_capacity(self.peers.len() + 1);
        if self.is_voter {
            match_indexes.push(self.last_log.index);
        }
        for peer in &self.peers {
            if peer.is_voter() {
                match_indexes.push(peer.match_index);
            }
        }
        if match_indexes.is_empty() {
            return Ok(());
        }

        // The median-low element is the highest index stored by a majority.
        match_indexes.sort_unstable_by(|a, b| b.cmp(a));
        let majority_index = match_indexes[match_indexes.len() / 2];

        if majority_index > self.commit_index {
            let entry_term = if majority_index == self.last_log.index {
                self.last_log.term
            } else {
                let store = self.core.store.clone();
                self.core
                    .spawn_worker(move || store.get_log_entry(majority_index))
                    .await?
                    .map(|entry| entry.term)
                    .unwrap_or(0)
            };

            if entry_term == self.term {
                self.advance_commit(majority_index).await?;
            }
        }
        Ok(())
    }

    /// A leader that cannot reach a voting majority within an election
    /// timeout steps down rather than serve stale state.
    pub async fn check_leader_quorum(&mut self) -> store::Result<()> {
        if self.is_leading() && !self.has_election_quorum() {
            info!("[{}] Lost contact with the voter majority.", self.addr);
            self.step_down(self.term).await?;
        }
        Ok(())
    }
}
