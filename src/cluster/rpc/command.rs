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

use catalog::ClusterMember;
use store::log::raft::{LogIndex, NodeId, RaftId};

/// Mutations and cluster-service requests addressed to the leader. Local
/// operator surfaces and follower forwarding both arrive here; every
/// mutation becomes a replicated log entry before it is acknowledged.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum Command {
    /// A state-machine mutation (catalog, jobs, config).
    Propose {
        command: catalog::fsm::Command,
    },
    CreateJoinToken {
        ttl_secs: Option<i64>,
    },
    Join {
        token: String,
        member: ClusterMember,
    },
    Leave {
        node_id: NodeId,
    },
    PromoteMember {
        node_id: NodeId,
    },
    DemoteMember {
        node_id: NodeId,
    },
    RemoveMember {
        node_id: NodeId,
        force: bool,
    },
    ListMembers,
    TakeSnapshot,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum CommandResponse {
    /// The proposal committed and applied at this index.
    Applied {
        index: LogIndex,
    },
    JoinToken {
        token: String,
    },
    JoinAccepted {
        node_id: NodeId,
        leader_id: NodeId,
    },
    Members {
        members: Vec<ClusterMember>,
    },
    SnapshotTaken {
        last_included: RaftId,
    },
    /// Consensus preconditions, surfaced to the caller for retry after a
    /// redirect.
    NotLeader {
        leader_address: Option<String>,
    },
    ConfigChangeInFlight,
    QuorumViolation,
    TokenUnknown,
    TokenUsed,
    TokenExpired,
    Failed {
        reason: String,
    },
}
