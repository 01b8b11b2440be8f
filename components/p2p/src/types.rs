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

use catalog::fsm::SyncCursor;
use catalog::{DatasetRecord, JobRecord, Topic, TopicId};
use store::blob::ChunkHash;
use store::log::raft::NodeId;
use store::uuid::Uuid;

/// `/bib/discovery/1` — peer and catalog enumeration. Paginated; `page` is a
/// zero-based cursor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DiscoveryRequest {
    ListPeers { page: u32 },
    ListTopics { page: u32 },
    ListDatasets { topic_id: TopicId, page: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerRecord {
    pub peer_id: Vec<u8>,
    pub addresses: Vec<String>,
}

/// Responses carry `authoritative = false` when served from a cache-only
/// backend, so callers never mistake a mirror for a source of truth.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DiscoveryResponse {
    Peers {
        peers: Vec<PeerRecord>,
        authoritative: bool,
        done: bool,
    },
    Topics {
        topics: Vec<Topic>,
        authoritative: bool,
        done: bool,
    },
    Datasets {
        datasets: Vec<DatasetRecord>,
        authoritative: bool,
        done: bool,
    },
    Busy,
}

/// `/bib/sync/1` — catalog synchronization from a watermark cursor. The
/// server emits entries in non-decreasing `updated_at` order with ties
/// broken by `(topic_id, dataset_id)`, so resumption is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SyncRequest {
    pub topic_id: Option<TopicId>,
    pub cursor: SyncCursor,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncResponse {
    Entries {
        entries: Vec<DatasetRecord>,
        authoritative: bool,
        done: bool,
    },
    Busy,
}

/// `/bib/data/1` — chunked transfer. `wanted` is a serialized roaring
/// bitmap of desired chunk indexes; the server answers with frames for the
/// set bits it can serve, capped at `max_frames` per request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DataRequest {
    pub dataset_id: Uuid,
    pub wanted: Vec<u8>,
    pub max_frames: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChunkFrame {
    pub chunk_index: u32,
    pub hash: ChunkHash,
    pub size: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DataResponse {
    Chunks { frames: Vec<ChunkFrame> },
    UnknownDataset,
    Busy,
}

/// `/bib/jobs/1` — commit-then-distribute job hints. Assignments are pushed
/// by the leader after the Raft commit; workers pull on reconnect.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JobsRequest {
    Assign { job: JobRecord },
    Pull { node_id: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JobsResponse {
    Ack,
    Jobs(Vec<JobRecord>),
    Busy,
}

pub const TOPIC_GLOBAL: &str = "/bib/global";
pub const TOPIC_NODES: &str = "/bib/nodes";

pub fn topic_for(topic_id: &TopicId) -> String {
    format!("/bib/topics/{}", topic_id)
}

/// Best-effort gossip notification. The overlay signs messages; receivers
/// additionally drop anything outside the freshness window.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub issued_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NotificationKind {
    CatalogChanged { topic_id: TopicId },
    JobsChanged,
    NodeJoined { node_id: NodeId },
    NodeLeft { node_id: NodeId },
}

impl Notification {
    pub fn now(kind: NotificationKind) -> Self {
        Notification {
            kind,
            issued_at: store::chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_fresh(&self, now: i64, window_secs: i64) -> bool {
        now - self.issued_at <= window_secs
    }
}
