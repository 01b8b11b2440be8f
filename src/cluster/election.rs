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

use super::{Cluster, State, RAFT_LOG_BEHIND};
use crate::ClusterEvent;
use std::time::{Duration, Instant};
use store::log::raft::{NodeId, TermId};
use store::rand::Rng;
use store::tracing::debug;
use store::Store;

impl<T> Cluster<T>
where
    T: for<'x> Store<'x> + 'static,
{
    /// A majority of voters must be reachable for an election to have any
    /// chance of succeeding.
    pub fn has_election_quorum(&self) -> bool {
        let mut total = 0;
        let mut healthy = 0;
        if self.is_voter {
            total += 1;
            healthy += 1;
        }
        for peer in &self.peers {
            if peer.is_voter() {
                total += 1;
                if peer.is_online() {
                    healthy += 1;
                }
            }
        }
        total > 0 && healthy > total / 2
    }

    pub fn is_election_due(&self) -> bool {
        match self.state {
            State::Candidate { election_due }
            | State::Wait { election_due }
            | State::VotedFor { election_due, .. }
            | State::Follower { election_due, .. }
                if election_due >= Instant::now() =>
            {
                false
            }
            State::Leader => false,
            _ => true,
        }
    }

    pub fn time_to_next_election(&self) -> Option<u64> {
        match self.state {
            State::Candidate { election_due }
            | State::Wait { election_due }
            | State::VotedFor { election_due, .. }
            | State::Follower { election_due, .. } => {
                let now = Instant::now();
                Some(if election_due > now {
                    (election_due - now).as_millis() as u64
                } else {
                    0
                })
            }
            State::Leader => None,
        }
    }

    pub async fn start_election_timer(&mut self, now: bool) {
        self.state = State::Wait {
            election_due: self.election_timeout(now),
        };
        self.reset_votes();
        self.set_leader(None).await;
    }

    pub async fn run_for_election(&mut self, now: bool) -> store::Result<()> {
        self.state = State::Candidate {
            election_due: self.election_timeout(now),
        };
        self.term += 1;
        self.voted_for = Some(self.node_id);
        self.reset_votes();
        self.set_leader(None).await;
        // Vote for ourselves, durably, before asking anyone else.
        self.persist_hard_state().await?;
        debug!(
            "[{}] Running for election for term {}.",
            self.addr, self.term
        );
        Ok(())
    }

    pub async fn step_down(&mut self, term: TermId) -> store::Result<()> {
        self.reset_votes();
        self.set_leader(None).await;
        if term > self.term {
            // A new term voids the old vote; a same-term step-down (quorum
            // loss) must keep it.
            self.voted_for = None;
            self.term = term;
        }
        self.persist_hard_state().await?;
        self.state = State::Wait {
            election_due: match self.state {
                State::Wait { election_due }
                | State::Candidate { election_due }
                | State::VotedFor { election_due, .. }
                    if election_due < Instant::now() =>
                {
                    election_due
                }
                _ => self.election_timeout(false),
            },
        };
        debug!("[{}] Stepping down for term {}.", self.addr, self.term);
        Ok(())
    }

    /// Uniformly random due time in `[election_timeout, 2 * election_timeout]`.
    pub fn election_timeout(&self, now: bool) -> Instant {
        Instant::now()
            + Duration::from_millis(
                if now {
                    0
                } else {
                    self.config.election_timeout
                } + store::rand::thread_rng().gen_range(0..=self.config.election_timeout),
            )
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self.state, State::Candidate { .. })
    }

    pub fn is_leading(&self) -> bool {
        matches!(self.state, State::Leader)
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        match self.state {
            State::Leader => Some(self.node_id),
            State::Follower { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Publishes the current leader to the IPC surface and the observer
    /// channel.
    pub async fn set_leader(&self, leader_id: Option<NodeId>) {
        if let Some(ipc) = &self.core.cluster {
            let previous = {
                let mut current = ipc.leader_id.lock();
                let previous = *current;
                *current = leader_id;
                previous
            };
            *ipc.leader_address.lock() = leader_id.and_then(|leader_id| {
                if leader_id == self.node_id {
                    Some(self.addr.to_string())
                } else {
                    self.peers
                        .iter()
                        .find(|peer| peer.node_id == leader_id)
                        .map(|peer| peer.addr.clone())
                }
            });
            if leader_id != Some(self.node_id) {
                ipc.state.store(RAFT_LOG_BEHIND, std::sync::atomic::Ordering::Relaxed);
            }
            if previous != leader_id {
                self.core
                    .cluster_events
                    .send(ClusterEvent::LeaderChanged { leader_id })
                    .ok();
            }
        }
    }
}
