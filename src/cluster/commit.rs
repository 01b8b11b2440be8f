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

use super::rpc::command::CommandResponse;
use super::{AckKind, Cluster, PendingSnapshot};
use crate::BibServer;
use catalog::fsm::{ApplyEvent, Command};
use catalog::JobStatus;
use p2p::types::{topic_for, JobsRequest, Notification, NotificationKind, TOPIC_GLOBAL, TOPIC_NODES};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use store::log::raft::{EntryKind, HardState, LogIndex};
use store::serialize::key::SystemKey;
use store::serialize::StoreDeserialize;
use store::tracing::{debug, error};
use store::{Store, StoreError, Table, WriteOperation};

impl<T> Cluster<T>
where
    T: for<'x> Store<'x> + 'static,
{
    /// The vote promise and term must hit disk before any RPC answer that
    /// depends on them leaves this node.
    pub async fn persist_hard_state(&self) -> store::Result<()> {
        let state = HardState {
            current_term: self.term,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
        };
        let store = self.core.store.clone();
        self.core
            .spawn_worker(move || store.set_hard_state(&state))
            .await
    }

    /// Moves `commit_index` forward, applies the newly committed entries to
    /// the FSM in log order and fans the resulting events out to observers.
    pub async fn advance_commit(&mut self, new_commit: LogIndex) -> store::Result<()> {
        if new_commit <= self.commit_index {
            return Ok(());
        }
        self.commit_index = new_commit;
        self.persist_hard_state().await?;
        self.commit_index_tx.send(new_commit).ok();

        // Applying is fatal on failure: a node that cannot apply a
        // committed entry can only diverge from the cluster.
        let events = self.core.apply_committed(new_commit).await?;
        self.after_apply(events).await;
        self.complete_acks();
        Ok(())
    }

    async fn after_apply(&mut self, events: Vec<ApplyEvent>) {
        let mut membership_changed = false;
        for event in events {
            match &event {
                ApplyEvent::MembershipChanged => {
                    membership_changed = true;
                }
                ApplyEvent::JobsChanged { job_id } => {
                    if self.is_leading() {
                        self.push_job_hint(job_id).await;
                    }
                }
                _ => (),
            }

            // Observers (replication engine, gossip publisher) poll the
            // broadcast channel; nothing calls back into this task.
            self.core.fsm_events.send(event.clone()).ok();

            if self.is_leading() {
                self.publish_notification(&event).await;
            }
        }

        if membership_changed {
            self.sync_peers_with_membership().await;
            if let Some(index) = self.config_change {
                if self.commit_index >= index {
                    self.config_change = None;
                }
            }
            self.core
                .cluster_events
                .send(crate::ClusterEvent::MembershipChanged)
                .ok();
        }
    }

    async fn publish_notification(&self, event: &ApplyEvent) {
        let p2p = match &self.core.p2p {
            Some(p2p) => p2p.clone(),
            None => return,
        };
        let (topic, kind) = match event {
            ApplyEvent::CatalogChanged { topic_id } => (
                topic_for(topic_id),
                NotificationKind::CatalogChanged {
                    topic_id: *topic_id,
                },
            ),
            ApplyEvent::JobsChanged { .. } => (TOPIC_NODES.to_string(), NotificationKind::JobsChanged),
            ApplyEvent::ConfigChanged { .. } => return,
            ApplyEvent::MembershipChanged => (
                TOPIC_GLOBAL.to_string(),
                NotificationKind::NodeJoined {
                    node_id: self.node_id,
                },
            ),
        };
        tokio::spawn(async move {
            if topic != TOPIC_GLOBAL {
                // Mirror to the global channel for nodes that only follow it.
                p2p.publish(TOPIC_GLOBAL.to_string(), Notification::now(kind.clone()))
                    .await
                    .ok();
            }
            p2p.publish(topic, Notification::now(kind)).await.ok();
        });
    }

    /// Commit-then-distribute: after a job assignment commits, the leader
    /// pushes a hint to the assigned node over `/bib/jobs/1`. Workers that
    /// miss it pull on reconnect.
    async fn push_job_hint(&self, job_id: &str) {
        let p2p = match &self.core.p2p {
            Some(p2p) => p2p.clone(),
            None => return,
        };
        let (job, peer_id) = {
            let fsm = self.core.fsm.read();
            let job = match fsm.job(job_id) {
                Some(job) if job.status == JobStatus::Assigned => job.clone(),
                _ => return,
            };
            let peer_id = job
                .assigned_node
                .and_then(|node_id| fsm.member(node_id))
                .and_then(|member| p2p::PeerId::from_bytes(&member.peer_id).ok());
            (job, peer_id)
        };
        if let Some(peer_id) = peer_id {
            tokio::spawn(async move {
                if let Err(e) = p2p
                    .request_jobs(peer_id, JobsRequest::Assign { job })
                    .await
                {
                    debug!("Job hint push failed: {}", e);
                }
            });
        }
    }

    /// Completes every proposal whose entry has committed.
    pub fn complete_acks(&mut self) {
        let commit_index = self.commit_index;
        let leader_id = self.node_id;
        let committed = self
            .pending_acks
            .keys()
            .copied()
            .take_while(|index| *index <= commit_index)
            .collect::<Vec<_>>();

        for index in committed {
            for ack in self.pending_acks.remove(&index).unwrap_or_default() {
                let response = match ack.kind {
                    AckKind::Applied(response_tx) => {
                        response_tx.send(CommandResponse::Applied { index }).ok();
                        continue;
                    }
                    AckKind::JoinToken {
                        external,
                        response_tx,
                    } => (response_tx, CommandResponse::JoinToken { token: external }),
                    AckKind::Join {
                        node_id,
                        response_tx,
                    } => (
                        response_tx,
                        CommandResponse::JoinAccepted { node_id, leader_id },
                    ),
                };
                response.0.send(response.1).ok();
            }
        }
    }

    /// Fails proposals that missed the commit timeout (e.g. quorum loss
    /// after append).
    pub fn sweep_expired_acks(&mut self) {
        let now = Instant::now();
        let expired = self
            .pending_acks
            .iter()
            .filter(|(_, acks)| acks.iter().any(|ack| ack.deadline <= now))
            .map(|(index, _)| *index)
            .collect::<Vec<_>>();

        for index in expired {
            if let Some(acks) = self.pending_acks.remove(&index) {
                for ack in acks {
                    let response_tx = match ack.kind {
                        AckKind::Applied(tx) => tx,
                        AckKind::JoinToken { response_tx, .. } => response_tx,
                        AckKind::Join { response_tx, .. } => response_tx,
                    };
                    response_tx
                        .send(CommandResponse::Failed {
                            reason: "commit timed out".to_string(),
                        })
                        .ok();
                }
            }
        }
    }
}

impl<T> BibServer<T>
where
    T: for<'x> Store<'x> + 'static,
{
    /// Applies all committed-but-unapplied entries, in log order, each as
    /// one atomic batch together with the advanced `applied_index`.
    pub async fn apply_committed(self: &Arc<Self>, up_to: LogIndex) -> store::Result<Vec<ApplyEvent>> {
        let this = self.clone();
        self.spawn_worker(move || this.apply_committed_blocking(up_to))
            .await
    }

    fn apply_committed_blocking(&self, up_to: LogIndex) -> store::Result<Vec<ApplyEvent>> {
        let mut events = Vec::new();

        let mut index = self.store.get_applied_index() + 1;
        while index <= up_to {
            let entry = self.store.get_log_entry(index)?.ok_or_else(|| {
                StoreError::DataCorruption(format!("Missing committed log entry {}.", index))
            })?;

            let mut ops = match entry.kind {
                EntryKind::Noop => Vec::new(),
                EntryKind::Command | EntryKind::Configuration => {
                    let command = Command::deserialize(&entry.payload).ok_or_else(|| {
                        StoreError::DataCorruption(format!(
                            "Undecodable command in log entry {}.",
                            index
                        ))
                    })?;
                    let mut fsm = self.fsm.write();
                    let outcome = fsm.apply(command)?;
                    drop(fsm);
                    events.extend(outcome.event);
                    outcome.ops
                }
            };
            ops.push(WriteOperation::set(
                Table::System,
                SystemKey::APPLIED_INDEX.to_vec(),
                index.to_be_bytes().to_vec(),
            ));
            self.store.db.write(ops)?;
            self.store.applied_index.store(index, Ordering::Release);

            index += 1;
        }

        Ok(events)
    }

    /// Replaces the entire FSM with a snapshot payload: the four tables are
    /// cleared and rebuilt in one batch, the log is reset, and the snapshot
    /// itself is persisted locally so this node can later serve it.
    pub async fn restore_snapshot(self: &Arc<Self>, pending: PendingSnapshot) -> store::Result<()> {
        let this = self.clone();
        self.spawn_worker(move || {
            let mut ops = Vec::new();
            for table in [Table::Catalog, Table::Jobs, Table::Config, Table::Membership] {
                ops.extend(this.store.clear_table_ops(table)?);
            }

            let mut fsm = this.fsm.write();
            ops.extend(fsm.restore(&pending.buffer)?);
            ops.push(WriteOperation::set(
                Table::System,
                SystemKey::APPLIED_INDEX.to_vec(),
                pending.last_included.index.to_be_bytes().to_vec(),
            ));
            this.store.db.write(ops)?;
            drop(fsm);

            this.store
                .applied_index
                .store(pending.last_included.index, Ordering::Release);
            this.store.truncate_log_from(1)?;
            this.store
                .raft_term
                .store(pending.last_included.term, Ordering::Release);
            this.store
                .raft_index
                .store(pending.last_included.index, Ordering::Release);
            this.store.snapshots.write(
                pending.last_included,
                pending.configuration,
                &pending.buffer,
            )?;
            Ok(())
        })
        .await
    }
}

/// Fatal apply failures crash the node: crashing is safer than diverging
/// from the cluster.
pub fn fatal_apply_error(err: &StoreError) -> ! {
    error!("Fatal error applying committed entries: {}", err);
    std::process::exit(1);
}
