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

use super::log::{InstallSnapshotRequest, InstallSnapshotResponse};
use super::rpc::Request;
use super::{Cluster, InstallProgress, NodeId, SNAPSHOT_SEGMENT_BYTES};
use std::time::Instant;
use store::log::raft::RaftId;
use store::tracing::{debug, info};
use store::Store;

impl<T> Cluster<T>
where
    T: for<'x> Store<'x> + 'static,
{
    /// Snapshots are taken on an interval or when enough entries have been
    /// applied since the last one, whichever comes first.
    pub async fn maybe_snapshot(&mut self) -> store::Result<()> {
        let applied = self.core.store.get_applied_index();
        if applied <= self.last_snapshot.index {
            return Ok(());
        }
        let due_by_threshold =
            applied - self.last_snapshot.index >= self.config.snapshot_threshold;
        let due_by_interval = self.last_snapshot_time.elapsed().as_secs()
            >= self.config.snapshot_interval;
        if due_by_threshold || due_by_interval {
            self.take_snapshot().await?;
        }
        Ok(())
    }

    /// Serializes the FSM under its read lock (blocking new applies for the
    /// duration of the serialization only), persists the snapshot and
    /// compacts the log behind it.
    pub async fn take_snapshot(&mut self) -> store::Result<Option<RaftId>> {
        let applied = self.core.store.get_applied_index();
        if applied == 0 || applied <= self.last_snapshot.index {
            return Ok(None);
        }

        let last_term = {
            let store = self.core.store.clone();
            self.core
                .spawn_worker(move || store.get_log_entry(applied))
                .await?
                .map(|entry| entry.term)
                .unwrap_or(self.last_snapshot.term)
        };
        let last_included = RaftId::new(last_term, applied);
        let trailing_logs = self.config.trailing_logs;

        let core = self.core.clone();
        self.core
            .spawn_worker(move || {
                let (payload, configuration) = {
                    let fsm = core.fsm.read();
                    (
                        fsm.snapshot()?,
                        store::bincode::serialize(&fsm.list_members())
                            .unwrap_or_default(),
                    )
                };
                core.store
                    .snapshots
                    .write(last_included, configuration, &payload)?;
                core.store
                    .compact_log_up_to(last_included.index.saturating_sub(trailing_logs))?;
                Ok(())
            })
            .await?;

        info!(
            "[{}] Snapshot taken at {}/{}.",
            self.addr, last_included.term, last_included.index
        );
        self.last_snapshot = last_included;
        self.last_snapshot_time = Instant::now();
        Ok(Some(last_included))
    }

    /// Starts streaming the latest snapshot to a follower whose next entry
    /// was already compacted away.
    pub async fn start_snapshot_install(&mut self, node_id: NodeId) -> store::Result<()> {
        let meta = {
            let store = self.core.store.clone();
            match self
                .core
                .spawn_worker(move || store.snapshots.latest())
                .await?
            {
                Some(meta) => meta,
                None => return Ok(()),
            }
        };

        let started = match self.get_peer_mut(node_id) {
            Some(peer) if peer.installing.is_none() => {
                debug!(
                    "Follower {} is behind the compacted log, streaming snapshot {}/{}.",
                    node_id, meta.last_included.term, meta.last_included.index
                );
                peer.installing = Some(InstallProgress { meta, offset: 0 });
                true
            }
            _ => false,
        };
        if started {
            self.send_snapshot_segment(node_id).await?;
        }
        Ok(())
    }

    pub async fn send_snapshot_segment(&mut self, node_id: NodeId) -> store::Result<()> {
        let term = self.term;
        let leader_id = self.node_id;

        let (meta, offset) = match self
            .get_peer(node_id)
            .and_then(|peer| peer.installing.as_ref())
        {
            Some(progress) => (progress.meta.clone(), progress.offset),
            None => return Ok(()),
        };

        let data = {
            let store = self.core.store.clone();
            let meta = meta.clone();
            self.core
                .spawn_worker(move || {
                    store
                        .snapshots
                        .read_segment(&meta, offset, SNAPSHOT_SEGMENT_BYTES)
                })
                .await?
        };
        let done = offset + data.len() as u64 >= meta.size;

        if let Some(peer) = self.get_peer(node_id) {
            peer.dispatch_request(Request::InstallSnapshot {
                term,
                request: InstallSnapshotRequest {
                    leader_id,
                    last_included: meta.last_included,
                    configuration: meta.configuration.clone(),
                    offset,
                    data,
                    done,
                },
            })
            .await;
        }
        Ok(())
    }

    pub async fn handle_install_snapshot_response(
        &mut self,
        node_id: NodeId,
        response: InstallSnapshotResponse,
    ) -> store::Result<()> {
        if response.term > self.term {
            self.step_down(response.term).await?;
            return Ok(());
        }
        if !self.is_leading() {
            return Ok(());
        }

        let finished = {
            let peer = match self.get_peer_mut(node_id) {
                Some(peer) => peer,
                None => return Ok(()),
            };
            match &mut peer.installing {
                Some(progress) => {
                    if response.success && response.offset >= progress.meta.size {
                        let last_included = progress.meta.last_included;
                        peer.installing = None;
                        peer.next_index = last_included.index + 1;
                        peer.match_index = last_included.index;
                        true
                    } else {
                        // Resume from the offset the follower expects.
                        progress.offset = response.offset;
                        false
                    }
                }
                None => return Ok(()),
            }
        };

        if finished {
            debug!("Follower {} finished snapshot install.", node_id);
            self.try_advance_commit_index().await?;
            self.send_append_entries().await?;
        } else {
            self.send_snapshot_segment(node_id).await?;
        }
        Ok(())
    }
}
