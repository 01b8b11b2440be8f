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

use self::rpc::command::CommandResponse;
use crate::BibServer;
use catalog::MemberRole;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::{net::SocketAddr, time::Instant};
use store::log::raft::{LogIndex, NodeId, RaftId, TermId};
use store::log::snapshot::SnapshotMeta;
use store::Store;
use tokio::sync::{mpsc, oneshot, watch};

pub mod commit;
pub mod election;
pub mod follower;
pub mod init;
pub mod leader;
pub mod log;
pub mod main;
pub mod membership;
pub mod rpc;
pub mod snapshot;
pub mod vote;

pub const IPC_CHANNEL_BUFFER: usize = 1024;

pub const RAFT_LOG_BEHIND: u8 = 0;
pub const RAFT_LOG_UPDATED: u8 = 1;
pub const RAFT_LOG_LEADER: u8 = 2;

/// Segment size for streaming snapshots to lagging followers.
pub const SNAPSHOT_SEGMENT_BYTES: usize = 256 * 1024;

#[derive(Debug)]
pub enum State {
    Wait {
        election_due: Instant,
    },
    Candidate {
        election_due: Instant,
    },
    VotedFor {
        node_id: NodeId,
        election_due: Instant,
    },
    Leader,
    Follower {
        node_id: NodeId,
        election_due: Instant,
    },
}

pub struct Cluster<T>
where
    T: for<'x> Store<'x> + 'static,
{
    // Local node
    pub node_id: NodeId,
    pub addr: SocketAddr,
    pub is_voter: bool,
    pub bootstrap: bool,

    pub config: Config,

    // Raft state
    pub term: TermId,
    pub voted_for: Option<NodeId>,
    pub state: State,
    pub last_log: RaftId,
    pub commit_index: LogIndex,
    pub last_snapshot: RaftId,
    pub last_snapshot_time: Instant,

    // Membership-derived peer connections
    pub peers: Vec<Peer>,

    // Proposals waiting for their commit, keyed by log index.
    pub pending_acks: BTreeMap<LogIndex, Vec<PendingAck>>,
    // Only one configuration change may be in flight.
    pub config_change: Option<LogIndex>,
    // Incoming snapshot transfer (follower side).
    pub pending_snapshot: Option<PendingSnapshot>,

    // IPC
    pub core: Arc<BibServer<T>>,
    pub tx: mpsc::Sender<Event>,
    pub commit_index_tx: watch::Sender<LogIndex>,
}

pub struct Config {
    pub key: String,
    pub heartbeat_timeout: u64,    // 500 ms
    pub election_timeout: u64,     // 1000 ms
    pub commit_timeout: u64,       // 10 * 1000 ms
    pub max_append_entries: usize, // 64
    pub max_append_bytes: usize,   // 10 * 1024 * 1024
    pub trailing_logs: u64,        // 256
    pub snapshot_interval: u64,    // 3600 s
    pub snapshot_threshold: u64,   // 8192 entries
    pub rpc_timeout: u64,          // 1000 ms
    pub rpc_inactivity_timeout: u64,
    pub rpc_retries_max: u32,
    pub rpc_backoff_max: u64,
}

#[derive(Debug)]
pub enum Event {
    RpcRequest {
        node_id: NodeId,
        request: rpc::Request,
        response_tx: oneshot::Sender<rpc::Response>,
    },
    RpcResponse {
        node_id: NodeId,
        response: rpc::Response,
    },
    RpcCommand {
        command: rpc::command::Command,
        response_tx: oneshot::Sender<CommandResponse>,
    },
    StepDown {
        term: TermId,
    },
    Shutdown,

    #[cfg(test)]
    SetOffline {
        is_offline: bool,
    },
}

#[derive(Debug)]
pub struct Peer {
    pub node_id: NodeId,
    pub addr: String,
    pub role: MemberRole,

    pub tx: mpsc::Sender<rpc::RpcEvent>,
    pub online_rx: watch::Receiver<bool>,

    // Election state
    pub vote_granted: bool,

    // Leader bookkeeping
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    pub installing: Option<InstallProgress>,
}

#[derive(Debug)]
pub struct InstallProgress {
    pub meta: SnapshotMeta,
    pub offset: u64,
}

impl Peer {
    pub fn is_voter(&self) -> bool {
        self.role == MemberRole::Voter
    }

    pub fn is_online(&self) -> bool {
        *self.online_rx.borrow()
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.node_id, self.addr)
    }
}

/// Follower-side accumulation of a streamed snapshot.
pub struct PendingSnapshot {
    pub last_included: RaftId,
    pub configuration: Vec<u8>,
    pub buffer: Vec<u8>,
}

/// A proposal waiting for its entry to commit.
pub struct PendingAck {
    pub deadline: Instant,
    pub kind: AckKind,
}

pub enum AckKind {
    Applied(oneshot::Sender<CommandResponse>),
    JoinToken {
        external: String,
        response_tx: oneshot::Sender<CommandResponse>,
    },
    Join {
        node_id: NodeId,
        response_tx: oneshot::Sender<CommandResponse>,
    },
}

pub struct ClusterIpc {
    pub tx: mpsc::Sender<Event>,
    pub state: AtomicU8,
    pub leader_id: store::parking_lot::Mutex<Option<NodeId>>,
    pub leader_address: store::parking_lot::Mutex<Option<String>>,
    pub commit_index_rx: watch::Receiver<LogIndex>,
}

impl ClusterIpc {
    pub fn is_leader(&self) -> bool {
        self.state.load(std::sync::atomic::Ordering::Relaxed) == RAFT_LOG_LEADER
    }
}
