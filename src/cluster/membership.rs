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

use super::rpc::command::{Command, CommandResponse};
use super::rpc::peer::spawn_peer_rpc;
use super::{AckKind, Cluster, Peer, PendingAck};
use catalog::fsm;
use catalog::{JoinToken, MemberRole, JOIN_TOKEN_TTL_SECS};
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};
use store::log::raft::{Entry, EntryKind, LogIndex};
use store::rand::Rng;
use store::serialize::StoreSerialize;
use store::tracing::{debug, error, info, warn};
use store::{Store, StoreError};
use tokio::sync::oneshot;

impl<T> Cluster<T>
where
    T: for<'x> Store<'x> + 'static,
{
    /// Entry point for operator commands and forwarded proposals. Every
    /// mutation requires leadership; reads are served from the local FSM.
    pub async fn handle_command(
        &mut self,
        command: Command,
        response_tx: oneshot::Sender<CommandResponse>,
    ) -> store::Result<()> {
        // Local reads first.
        if let Command::ListMembers = &command {
            let members = self
                .core
                .fsm
                .read()
                .list_members()
                .into_iter()
                .cloned()
                .collect();
            response_tx.send(CommandResponse::Members { members }).ok();
            return Ok(());
        }

        if !self.is_leading() {
            let leader_address = self
                .core
                .cluster
                .as_ref()
                .and_then(|ipc| ipc.leader_address.lock().clone());
            response_tx
                .send(CommandResponse::NotLeader { leader_address })
                .ok();
            return Ok(());
        }

        match command {
            Command::Propose { command } => {
                let index = self.propose(EntryKind::Command, &command).await?;
                self.register_ack(index, AckKind::Applied(response_tx));
                self.replicate_now().await?;
            }
            Command::CreateJoinToken { ttl_secs } => {
                let now = store::chrono::Utc::now().timestamp();
                let token = JoinToken {
                    token: random_token(),
                    cluster_name: self.config.key_fingerprint(),
                    leader_address: self.addr.to_string(),
                    expires_at: now + ttl_secs.unwrap_or(JOIN_TOKEN_TTL_SECS),
                    used: false,
                };
                let external = token.encode_external();
                let index = self
                    .propose(EntryKind::Command, &fsm::Command::JoinTokenCreate(token))
                    .await?;
                self.register_ack(
                    index,
                    AckKind::JoinToken {
                        external,
                        response_tx,
                    },
                );
                self.replicate_now().await?;
            }
            Command::Join { token, member } => {
                // Validate against the replicated token table so every
                // replica could reach the same verdict.
                let verdict = {
                    let fsm = self.core.fsm.read();
                    match fsm.token(&token) {
                        None => Some(CommandResponse::TokenUnknown),
                        Some(record) if record.used => Some(CommandResponse::TokenUsed),
                        Some(record)
                            if record.is_expired(store::chrono::Utc::now().timestamp()) =>
                        {
                            Some(CommandResponse::TokenExpired)
                        }
                        Some(_) if fsm.member(member.node_id).is_some() => {
                            Some(CommandResponse::Failed {
                                reason: format!("node id {} is already a member", member.node_id),
                            })
                        }
                        Some(_) => None,
                    }
                };
                if let Some(rejection) = verdict {
                    info!(
                        "[{}] Rejected join of node {}: {:?}",
                        self.addr, member.node_id, rejection
                    );
                    response_tx.send(rejection).ok();
                    return Ok(());
                }
                if self.config_change.is_some() {
                    response_tx.send(CommandResponse::ConfigChangeInFlight).ok();
                    return Ok(());
                }

                let node_id = member.node_id;
                info!("[{}] Admitting node {} to the cluster.", self.addr, node_id);
                self.propose(EntryKind::Command, &fsm::Command::JoinTokenConsume { token })
                    .await?;
                let index = self
                    .propose(EntryKind::Configuration, &fsm::Command::MemberAdd(member))
                    .await?;
                self.config_change = Some(index);
                self.register_ack(
                    index,
                    AckKind::Join {
                        node_id,
                        response_tx,
                    },
                );
                self.replicate_now().await?;
            }
            Command::PromoteMember { node_id } => {
                self.propose_role_change(node_id, MemberRole::Voter, response_tx)
                    .await?;
            }
            Command::DemoteMember { node_id } => {
                self.propose_role_change(node_id, MemberRole::NonVoter, response_tx)
                    .await?;
            }
            Command::RemoveMember { node_id, force } => {
                self.propose_removal(node_id, force, response_tx).await?;
            }
            Command::Leave { node_id } => {
                self.propose_removal(node_id, true, response_tx).await?;
            }
            Command::TakeSnapshot => {
                match self.take_snapshot().await {
                    Ok(Some(last_included)) => {
                        response_tx
                            .send(CommandResponse::SnapshotTaken { last_included })
                            .ok();
                    }
                    Ok(None) => {
                        response_tx
                            .send(CommandResponse::Failed {
                                reason: "nothing to snapshot".to_string(),
                            })
                            .ok();
                    }
                    Err(e) => {
                        response_tx
                            .send(CommandResponse::Failed {
                                reason: e.to_string(),
                            })
                            .ok();
                    }
                }
            }
            Command::ListMembers => unreachable!("handled above"),
        }

        Ok(())
    }

    async fn propose_role_change(
        &mut self,
        node_id: super::NodeId,
        role: MemberRole,
        response_tx: oneshot::Sender<CommandResponse>,
    ) -> store::Result<()> {
        if self.config_change.is_some() {
            response_tx.send(CommandResponse::ConfigChangeInFlight).ok();
            return Ok(());
        }
        if self.core.fsm.read().member(node_id).is_none() {
            response_tx
                .send(CommandResponse::Failed {
                    reason: format!("node {} is not a member", node_id),
                })
                .ok();
            return Ok(());
        }
        // Demoting the last voter would brick the cluster.
        if role == MemberRole::NonVoter && self.voter_count_without(node_id) < 2 {
            response_tx.send(CommandResponse::QuorumViolation).ok();
            return Ok(());
        }

        let index = self
            .propose(
                EntryKind::Configuration,
                &fsm::Command::MemberChangeRole { node_id, role },
            )
            .await?;
        self.config_change = Some(index);
        self.register_ack(index, AckKind::Applied(response_tx));
        self.replicate_now().await
    }

    async fn propose_removal(
        &mut self,
        node_id: super::NodeId,
        force: bool,
        response_tx: oneshot::Sender<CommandResponse>,
    ) -> store::Result<()> {
        if self.config_change.is_some() {
            response_tx.send(CommandResponse::ConfigChangeInFlight).ok();
            return Ok(());
        }
        let is_voter = self
            .core
            .fsm
            .read()
            .member(node_id)
            .map(|member| member.is_voter())
            .unwrap_or(false);
        if is_voter && self.voter_count_without(node_id) < 2 && !force {
            response_tx.send(CommandResponse::QuorumViolation).ok();
            return Ok(());
        }

        let index = self
            .propose(
                EntryKind::Configuration,
                &fsm::Command::MemberRemove { node_id, force },
            )
            .await?;
        self.config_change = Some(index);
        self.register_ack(index, AckKind::Applied(response_tx));
        self.replicate_now().await
    }

    fn voter_count_without(&self, node_id: super::NodeId) -> usize {
        self.core
            .fsm
            .read()
            .list_members()
            .iter()
            .filter(|member| member.is_voter() && member.node_id != node_id)
            .count()
    }

    /// Appends a command as a log entry; acknowledgment happens when the
    /// entry commits.
    pub async fn propose(
        &mut self,
        kind: EntryKind,
        command: &fsm::Command,
    ) -> store::Result<LogIndex> {
        let payload = command.serialize().ok_or_else(|| {
            StoreError::SerializeError("Failed to serialize command.".to_string())
        })?;
        self.append_entries(vec![Entry {
            term: self.term,
            kind,
            payload,
        }])
        .await
    }

    pub fn register_ack(&mut self, index: LogIndex, kind: AckKind) {
        self.pending_acks
            .entry(index)
            .or_default()
            .push(PendingAck {
                deadline: Instant::now() + Duration::from_millis(self.config.commit_timeout),
                kind,
            });
    }

    /// Replicates freshly appended entries, or commits immediately on a
    /// single-voter cluster.
    pub async fn replicate_now(&mut self) -> store::Result<()> {
        self.send_append_entries().await?;
        self.try_advance_commit_index().await
    }

    /// On first bootstrap the newly elected leader writes itself into the
    /// replicated membership.
    pub async fn ensure_self_member(&mut self) -> store::Result<()> {
        if self.core.fsm.read().member(self.node_id).is_some() {
            return Ok(());
        }
        let member = catalog::ClusterMember {
            node_id: self.node_id,
            raft_address: self.addr.to_string(),
            peer_id: self
                .core
                .p2p
                .as_ref()
                .map(|p2p| p2p.peer_id().to_bytes())
                .unwrap_or_default(),
            role: if self.is_voter {
                MemberRole::Voter
            } else {
                MemberRole::NonVoter
            },
            state: catalog::MemberState::Stable,
            joined_at: store::chrono::Utc::now().timestamp(),
        };
        info!("[{}] Bootstrapping cluster membership.", self.addr);
        self.propose(EntryKind::Configuration, &fsm::Command::MemberAdd(member))
            .await?;
        Ok(())
    }

    /// Rebuilds the peer connection set from the committed membership,
    /// spawning actors for new members and dropping removed ones.
    pub async fn sync_peers_with_membership(&mut self) {
        let members = {
            let fsm = self.core.fsm.read();
            fsm.list_members()
                .into_iter()
                .cloned()
                .collect::<Vec<_>>()
        };

        // Our own role may have changed.
        if let Some(member) = members.iter().find(|member| member.node_id == self.node_id) {
            self.is_voter = member.is_voter();
        }

        let next_index = self.last_log.index + 1;
        for member in &members {
            if member.node_id == self.node_id || self.is_known_peer(member.node_id) {
                if let Some(peer) = self.get_peer_mut(member.node_id) {
                    peer.role = member.role;
                }
                continue;
            }
            let addr = match member.raft_address.to_socket_addrs() {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => addr,
                    None => {
                        error!("Member {} has no resolvable address.", member.node_id);
                        continue;
                    }
                },
                Err(e) => {
                    error!(
                        "Failed to resolve address '{}' of member {}: {}",
                        member.raft_address, member.node_id, e
                    );
                    continue;
                }
            };
            debug!("[{}] Connecting to new member {}.", self.addr, member.node_id);
            let (tx, online_rx) = spawn_peer_rpc(
                self.tx.clone(),
                self.node_id,
                &self.config,
                member.node_id,
                addr,
            );
            self.peers.push(Peer {
                node_id: member.node_id,
                addr: member.raft_address.clone(),
                role: member.role,
                tx,
                online_rx,
                vote_granted: false,
                next_index,
                match_index: 0,
                installing: None,
            });
        }

        let before = self.peers.len();
        self.peers
            .retain(|peer| members.iter().any(|member| member.node_id == peer.node_id));
        if self.peers.len() != before {
            warn!(
                "[{}] Dropped {} removed cluster member(s).",
                self.addr,
                before - self.peers.len()
            );
        }
    }
}

impl super::Config {
    /// Stable, non-secret cluster identifier derived from the shared key.
    pub fn key_fingerprint(&self) -> String {
        let hash = store::blake3::hash(self.key.as_bytes());
        hash.to_hex()[..16].to_string()
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 16];
    store::rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}
