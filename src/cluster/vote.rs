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

use super::{rpc, State};
use super::{
    rpc::{Request, Response},
    Cluster, Peer,
};
use store::log::raft::{LogIndex, NodeId, RaftId, TermId};
use store::tracing::{debug, error, info};
use store::Store;
use tokio::sync::oneshot;

impl<T> Cluster<T>
where
    T: for<'x> Store<'x> + 'static,
{
    /// One vote per term, honored across restarts through the hard state.
    pub fn can_grant_vote(&self, candidate_node_id: NodeId) -> bool {
        match self.state {
            State::Wait { .. } => self
                .voted_for
                .map_or(true, |node_id| node_id == candidate_node_id),
            State::VotedFor { node_id, .. } => candidate_node_id == node_id,
            State::Leader | State::Follower { .. } | State::Candidate { .. } => false,
        }
    }

    pub async fn vote_for(&mut self, node_id: NodeId) -> store::Result<()> {
        self.state = State::VotedFor {
            node_id,
            election_due: self.election_timeout(false),
        };
        self.voted_for = Some(node_id);
        self.reset_votes();
        // The promise must hit disk before the response leaves this node.
        self.persist_hard_state().await?;
        self.set_leader(None).await;
        debug!(
            "[{}] Voted for node {} for term {}.",
            self.addr, node_id, self.term
        );
        Ok(())
    }

    pub fn reset_votes(&mut self) {
        self.peers.iter_mut().for_each(|peer| {
            peer.vote_granted = false;
        });
    }

    /// Counts the granted votes among voters, including this node's own.
    pub fn count_vote(&mut self, node_id: NodeId) -> bool {
        let mut total_voters = 0;
        let mut votes = 0;
        if self.is_voter {
            total_voters += 1;
            votes += 1;
        }

        self.peers.iter_mut().for_each(|peer| {
            if peer.is_voter() {
                total_voters += 1;
                if peer.node_id == node_id {
                    peer.vote_granted = true;
                    votes += 1;
                } else if peer.vote_granted {
                    votes += 1;
                }
            }
        });

        votes > total_voters / 2
    }

    pub async fn request_votes(&mut self, now: bool) -> store::Result<()> {
        if !self.is_voter {
            // Non-voters receive entries and snapshots but never start
            // elections.
            self.start_election_timer(false).await;
            return Ok(());
        }

        if self.has_election_quorum() {
            self.run_for_election(now).await?;

            let voter_peers = self
                .peers
                .iter()
                .filter(|peer| peer.is_voter())
                .count();
            if voter_peers == 0 {
                // Single-voter cluster: this node is the majority.
                self.become_leader().await?;
                return Ok(());
            }

            for peer in &self.peers {
                if peer.is_voter() && peer.is_online() {
                    peer.vote_for_me(self.term, self.last_log.index, self.last_log.term)
                        .await;
                }
            }
        } else {
            self.start_election_timer(false).await;
            info!(
                "[{}] Not enough reachable voters to start an election.",
                self.addr
            );
        }

        Ok(())
    }

    pub async fn handle_vote_request(
        &mut self,
        node_id: NodeId,
        response_tx: oneshot::Sender<rpc::Response>,
        term: TermId,
        last: RaftId,
    ) -> store::Result<()> {
        let response = if self.is_known_peer(node_id) {
            if self.term < term {
                self.step_down(term).await?;
            }
            let vote_granted = if self.term == term
                && self.can_grant_vote(node_id)
                && self.log_is_behind_or_eq(last.term, last.index)
            {
                self.vote_for(node_id).await?;
                true
            } else {
                false
            };
            Response::Vote {
                term: self.term,
                vote_granted,
            }
        } else {
            rpc::Response::UnregisteredPeer
        };

        response_tx
            .send(response)
            .unwrap_or_else(|_| error!("Oneshot response channel closed."));
        Ok(())
    }

    pub async fn handle_vote_response(
        &mut self,
        node_id: NodeId,
        term: TermId,
        vote_granted: bool,
    ) -> store::Result<()> {
        if self.term < term {
            self.step_down(term).await?;
            return Ok(());
        } else if !self.is_candidate() || !vote_granted || self.term != term {
            return Ok(());
        }

        if self.count_vote(node_id) {
            self.become_leader().await?;
        }

        Ok(())
    }

    pub fn is_known_peer(&self, node_id: NodeId) -> bool {
        self.peers.iter().any(|peer| peer.node_id == node_id)
    }

    pub fn get_peer(&self, node_id: NodeId) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.node_id == node_id)
    }

    pub fn get_peer_mut(&mut self, node_id: NodeId) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|peer| peer.node_id == node_id)
    }
}

impl Peer {
    pub async fn vote_for_me(&self, term: TermId, last_log_index: LogIndex, last_log_term: TermId) {
        self.dispatch_request(Request::Vote {
            term,
            last: RaftId::new(last_log_term, last_log_index),
        })
        .await;
    }

    /// Queues a request without waiting for the response; it comes back on
    /// the main event channel.
    pub async fn dispatch_request(&self, request: Request) {
        if self
            .tx
            .send(rpc::RpcEvent::Notify { request })
            .await
            .is_err()
        {
            debug!("Peer RPC channel for {} is closed.", self.node_id);
        }
    }
}
