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

pub mod fsm;

use store::blob::ChunkHash;
use store::log::raft::NodeId;
use store::serialize::{StoreDeserialize, StoreSerialize};
use store::uuid::Uuid;
use store::StoreError;

pub type TopicId = Uuid;
pub type DatasetId = Uuid;
pub type JobId = String;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Topic {
    pub topic_id: TopicId,
    pub name: String,
    pub schema: Vec<u8>,
    pub owner_peer_id: Vec<u8>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChunkRef {
    pub hash: ChunkHash,
    pub size: u32,
}

/// A sealed dataset version. Immutable: a new version is a new record with a
/// fresh `dataset_id`. The ordered chunk table travels with the record so
/// any replica can verify a transfer without further lookups.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DatasetRecord {
    pub dataset_id: DatasetId,
    pub topic_id: TopicId,
    pub name: String,
    pub size: u64,
    pub content_hash: ChunkHash,
    pub chunk_count: u32,
    pub chunks: Vec<ChunkRef>,
    pub owner_peer_id: Vec<u8>,
    pub metadata: Vec<u8>,
    pub updated_at: u64,
}

impl DatasetRecord {
    pub fn chunk_hashes(&self) -> Vec<ChunkHash> {
        self.chunks.iter().map(|chunk| chunk.hash).collect()
    }

    /// A record is well-formed when its chunk table matches its declared
    /// identity.
    pub fn is_well_formed(&self) -> bool {
        self.chunk_count as usize == self.chunks.len()
            && store::blob::content_hash(&self.chunk_hashes()) == self.content_hash
            && self.size == self.chunks.iter().map(|chunk| chunk.size as u64).sum::<u64>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JobStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: u8,
    pub assigned_node: Option<NodeId>,
    pub metadata: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MemberRole {
    Voter,
    NonVoter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MemberState {
    Joining,
    Stable,
    Leaving,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClusterMember {
    pub node_id: NodeId,
    pub raft_address: String,
    pub peer_id: Vec<u8>,
    pub role: MemberRole,
    pub state: MemberState,
    pub joined_at: i64,
}

impl ClusterMember {
    pub fn is_voter(&self) -> bool {
        self.role == MemberRole::Voter
    }
}

pub const JOIN_TOKEN_TTL_SECS: i64 = 24 * 3600;

/// Single-use admission credential. Creation and consumption are both
/// replicated commands so every replica can validate a redemption.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JoinToken {
    pub token: String,
    pub cluster_name: String,
    pub leader_address: String,
    pub expires_at: i64,
    pub used: bool,
}

impl JoinToken {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// External form: url-safe base64 (no padding) of the bincoded public
    /// fields. The `used` flag never leaves the cluster.
    pub fn encode_external(&self) -> String {
        base64::encode_config(
            store::bincode::serialize(&(
                &self.cluster_name,
                &self.leader_address,
                &self.token,
                self.expires_at,
            ))
            .unwrap_or_default(),
            base64::URL_SAFE_NO_PAD,
        )
    }

    pub fn decode_external(encoded: &str) -> Result<JoinToken, StoreError> {
        let bytes = base64::decode_config(encoded, base64::URL_SAFE_NO_PAD)
            .map_err(|e| StoreError::DeserializeError(format!("Invalid join token: {}", e)))?;
        let (cluster_name, leader_address, token, expires_at): (String, String, String, i64) =
            store::bincode::deserialize(&bytes)
                .map_err(|e| StoreError::DeserializeError(format!("Invalid join token: {}", e)))?;
        Ok(JoinToken {
            token,
            cluster_name,
            leader_address,
            expires_at,
            used: false,
        })
    }
}

macro_rules! impl_store_codec {
    ($($record:ty),*) => {
        $(
            impl StoreSerialize for $record {
                fn serialize(&self) -> Option<Vec<u8>> {
                    store::bincode::serialize(self).ok()
                }
            }

            impl StoreDeserialize for $record {
                fn deserialize(bytes: &[u8]) -> Option<Self> {
                    store::bincode::deserialize(bytes).ok()
                }
            }
        )*
    };
}

impl_store_codec!(
    Topic,
    DatasetRecord,
    JobRecord,
    ConfigEntry,
    ClusterMember,
    JoinToken
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_token_external_round_trip() {
        let token = JoinToken {
            token: "5f3e9c".to_string(),
            cluster_name: "lab".to_string(),
            leader_address: "10.0.0.1:7911".to_string(),
            expires_at: 1_700_000_000,
            used: true,
        };

        let decoded = JoinToken::decode_external(&token.encode_external()).unwrap();
        assert_eq!(decoded.token, token.token);
        assert_eq!(decoded.cluster_name, token.cluster_name);
        assert_eq!(decoded.leader_address, token.leader_address);
        assert_eq!(decoded.expires_at, token.expires_at);
        assert!(!decoded.used);

        assert!(JoinToken::decode_external("not base64!").is_err());
    }

    #[test]
    fn dataset_well_formedness() {
        let chunks = vec![
            ChunkRef {
                hash: ChunkHash::of(b"chunk 0"),
                size: 7,
            },
            ChunkRef {
                hash: ChunkHash::of(b"chunk 1"),
                size: 7,
            },
        ];
        let mut record = DatasetRecord {
            dataset_id: Uuid::new_v4(),
            topic_id: Uuid::new_v4(),
            name: "climate-2025".to_string(),
            size: 14,
            content_hash: store::blob::content_hash(&[chunks[0].hash, chunks[1].hash]),
            chunk_count: 2,
            chunks,
            owner_peer_id: vec![1, 2, 3],
            metadata: Vec::new(),
            updated_at: 1,
        };
        assert!(record.is_well_formed());

        record.chunk_count = 3;
        assert!(!record.is_well_formed());
    }
}
