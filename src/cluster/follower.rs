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

use super::log::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
};
use super::rpc::Response;
use super::{Cluster, PendingSnapshot, State, RAFT_LOG_UPDATED};
use std::sync::atomic::Ordering;
use store::log::raft::{NodeId, RaftId, TermId};
use store::tracing::{debug, error, info};
use store::Store;
use tokio::sync::oneshot;

impl<T> Cluster<T>
where
    T: for<'x> Store<'x> + 'static,
{
    pub async fn become_follower(&mut self, node_id: NodeId, term: TermId) -> store::Result<()> {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.persist_hard_state().await?;
        }
        let was_following = matches!(
            self.state,
            State::Follower { node_id: current, .. } if current == node_id
        );
        self.state = State::Follower {
            node_id,
            election_due: self.election_timeout(false),
        };
        if !was_following {
            debug!(
                "[{}] Following leader {} for term {}.",
                self.addr, node_id, self.term
            );
            self.set_leader(Some(node_id)).await;
        }
        Ok(())
    }

    pub async fn handle_append_entries(
        &mut self,
        node_id: NodeId,
        response_tx: oneshot::Sender<Response>,
        term: TermId,
        request: AppendEntriesRequest,
    ) -> store::Result<()> {
        if term < self.term {
            response_tx
                .send(Response::AppendEntries(AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    match_index: 0,
                }))
                .unwrap_or_else(|_| error!("Oneshot response channel closed."));
            return Ok(());
        }

        self.become_follower(node_id, term).await?;

        // Check that our log contains the leader's previous entry.
        let prev_log = request.prev_log;
        let local_prev = if prev_log.index == 0 || prev_log.index == self.last_snapshot.index {
            None
        } else {
            let store = self.core.store.clone();
            let index = prev_log.index;
            self.core
                .spawn_worker(move || store.get_log_entry(index))
                .await?
        };

        if !self.matches_prev_log(&prev_log, local_prev) {
            let match_hint = std::cmp::min(
                prev_log.index.saturating_sub(1),
                self.last_log.index,
            );
            response_tx
                .send(Response::AppendEntries(AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    match_index: match_hint,
                }))
                .unwrap_or_else(|_| error!("Oneshot response channel closed."));
            return Ok(());
        }

        // Drop a conflicting suffix, then append what is actually new.
        let mut match_index = prev_log.index;
        if !request.entries.is_empty() {
            let store = self.core.store.clone();
            let last_log_index = self.last_log.index;
            let entries = request.entries;
            let last = self
                .core
                .spawn_worker(move || {
                    let mut to_append = Vec::with_capacity(entries.len());
                    for (index, entry) in entries {
                        if to_append.is_empty() && index <= last_log_index {
                            match store.get_log_entry(index)? {
                                Some(existing) if existing.term == entry.term => {
                                    continue;
                                }
                                _ => {
                                    store.truncate_log_from(index)?;
                                }
                            }
                        }
                        to_append.push((index, entry));
                    }
                    let last = to_append
                        .last()
                        .map(|(index, entry)| RaftId::new(entry.term, *index));
                    store.append_log_entries(to_append)?;
                    Ok(last)
                })
                .await?;
            if let Some(last) = last {
                self.last_log = last;
            } else {
                self.last_log = self.core.store.last_log_id();
            }
            match_index = self.last_log.index;
        }

        response_tx
            .send(Response::AppendEntries(AppendEntriesResponse {
                term: self.term,
                success: true,
                match_index,
            }))
            .unwrap_or_else(|_| error!("Oneshot response channel closed."));

        // Apply whatever the leader already committed.
        let new_commit = std::cmp::min(request.commit_index, match_index);
        self.advance_commit(new_commit).await?;
        if self.commit_index >= request.commit_index {
            if let Some(ipc) = &self.core.cluster {
                ipc.state.store(RAFT_LOG_UPDATED, Ordering::Relaxed);
            }
        }

        Ok(())
    }

    /// Accumulates a streamed snapshot; on the final segment the whole FSM
    /// is replaced and the log reset to the snapshot position.
    pub async fn handle_install_snapshot(
        &mut self,
        node_id: NodeId,
        response_tx: oneshot::Sender<Response>,
        term: TermId,
        request: InstallSnapshotRequest,
    ) -> store::Result<()> {
        if term < self.term {
            response_tx
                .send(Response::InstallSnapshot(InstallSnapshotResponse {
                    term: self.term,
                    success: false,
                    offset: 0,
                }))
                .unwrap_or_else(|_| error!("Oneshot response channel closed."));
            return Ok(());
        }

        self.become_follower(node_id, term).await?;

        if request.offset == 0 {
            self.pending_snapshot = Some(PendingSnapshot {
                last_included: request.last_included,
                configuration: request.configuration.clone(),
                buffer: Vec::new(),
            });
        }

        let (success, next_offset) = match &mut self.pending_snapshot {
            Some(pending)
                if pending.last_included == request.last_included
                    && pending.buffer.len() as u64 == request.offset =>
            {
                pending.buffer.extend_from_slice(&request.data);
                (true, pending.buffer.len() as u64)
            }
            Some(pending) => (false, pending.buffer.len() as u64),
            None => (false, 0),
        };

        if success && request.done {
            let pending = self.pending_snapshot.take().unwrap();
            info!(
                "[{}] Installing snapshot up to {}/{} ({} bytes).",
                self.addr,
                pending.last_included.term,
                pending.last_included.index,
                pending.buffer.len()
            );

            let core = self.core.clone();
            let last_included = pending.last_included;
            core.restore_snapshot(pending).await?;

            self.last_log = last_included;
            self.last_snapshot = last_included;
            self.commit_index = last_included.index;
            self.persist_hard_state().await?;
            self.commit_index_tx.send(self.commit_index).ok();
            self.sync_peers_with_membership().await;
        }

        response_tx
            .send(Response::InstallSnapshot(InstallSnapshotResponse {
                term: self.term,
                success,
                offset: next_offset,
            }))
            .unwrap_or_else(|_| error!("Oneshot response channel closed."));

        Ok(())
    }
}
