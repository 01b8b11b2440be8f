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

use catalog::fsm::{ApplyEvent, Fsm};
use cluster::ClusterIpc;
use p2p::node::P2pHandle;
use std::sync::Arc;
use store::log::raft::NodeId;
use store::parking_lot::RwLock;
use store::BibStore;
use tokio::sync::{broadcast, watch};

pub mod cluster;
pub mod replication;
pub mod server;

#[cfg(test)]
pub mod tests;

pub const DEFAULT_RPC_PORT: u16 = 7911;
pub const DEFAULT_P2P_PORT: u16 = 7912;

/// Cluster-level observations. Modeled as a bounded broadcast channel so
/// that observers poll instead of calling back into the consensus task.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    LeaderChanged { leader_id: Option<NodeId> },
    MembershipChanged,
}

pub struct BibServer<T> {
    pub store: Arc<BibStore<T>>,
    pub fsm: Arc<RwLock<Fsm>>,
    pub worker_pool: rayon::ThreadPool,

    pub node_id: NodeId,
    pub cluster: Option<ClusterIpc>,
    pub p2p: Option<P2pHandle>,

    /// Committed FSM mutations, observed by the replication engine and the
    /// gossip publisher.
    pub fsm_events: broadcast::Sender<ApplyEvent>,
    pub cluster_events: broadcast::Sender<ClusterEvent>,
    pub shutdown_tx: watch::Sender<bool>,

    #[cfg(test)]
    pub is_offline: std::sync::atomic::AtomicBool,
}
