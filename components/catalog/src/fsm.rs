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

use std::collections::BTreeMap;

use store::ahash::AHashMap;
use store::log::raft::NodeId;
use store::serialize::key::CatalogKey;
use store::serialize::{StoreDeserialize, StoreSerialize};
use store::tracing::warn;
use store::uuid::Uuid;
use store::{Direction, Store, StoreError, Table, WriteOperation};

use crate::{
    ClusterMember, ConfigEntry, DatasetId, DatasetRecord, JobId, JobRecord, JobStatus, JoinToken,
    MemberRole, TopicId, Topic,
};

/// Replicated commands. Applying the same sequence on an empty machine
/// yields byte-identical state on every replica: apply never reads clocks,
/// randomness or local configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Command {
    TopicUpsert(Topic),
    TopicDelete {
        topic_id: TopicId,
    },
    CatalogUpsert(DatasetRecord),
    CatalogDelete {
        topic_id: TopicId,
        dataset_id: DatasetId,
    },
    JobUpsert(JobRecord),
    JobAssign {
        job_id: JobId,
        node_id: NodeId,
    },
    JobTerminate {
        job_id: JobId,
        status: JobStatus,
    },
    ConfigSet {
        key: String,
        value: Vec<u8>,
    },
    ConfigDelete {
        key: String,
    },
    MemberAdd(ClusterMember),
    MemberRemove {
        node_id: NodeId,
        force: bool,
    },
    MemberChangeRole {
        node_id: NodeId,
        role: MemberRole,
    },
    JoinTokenCreate(JoinToken),
    JoinTokenConsume {
        token: String,
    },
}

impl StoreSerialize for Command {
    fn serialize(&self) -> Option<Vec<u8>> {
        store::bincode::serialize(self).ok()
    }
}

impl StoreDeserialize for Command {
    fn deserialize(bytes: &[u8]) -> Option<Self> {
        store::bincode::deserialize(bytes).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyEvent {
    CatalogChanged { topic_id: TopicId },
    JobsChanged { job_id: JobId },
    ConfigChanged { key: String },
    MembershipChanged,
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub ops: Vec<WriteOperation>,
    pub event: Option<ApplyEvent>,
}

const MEMBER_KEY_PREFIX: u8 = 0;
const TOKEN_KEY_PREFIX: u8 = 1;

fn member_key(node_id: NodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(MEMBER_KEY_PREFIX);
    key.extend_from_slice(&node_id.to_be_bytes());
    key
}

fn token_key(token: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + token.len());
    key.push(TOKEN_KEY_PREFIX);
    key.extend_from_slice(token.as_bytes());
    key
}

/// Deterministic state machine over the four replicated sections. The
/// in-memory maps are the authoritative working copy; every apply returns
/// the write batch that brings the durable backend in sync.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Fsm {
    pub topics: BTreeMap<TopicId, Topic>,
    pub datasets: BTreeMap<(TopicId, DatasetId), DatasetRecord>,
    pub jobs: BTreeMap<JobId, JobRecord>,
    pub config: BTreeMap<String, ConfigEntry>,
    pub members: BTreeMap<NodeId, ClusterMember>,
    pub tokens: BTreeMap<String, JoinToken>,

    // Derived, rebuilt on load and restore.
    #[serde(skip)]
    topics_by_name: AHashMap<String, TopicId>,
}

impl Fsm {
    /// Rebuilds the machine from the durable backend at startup.
    pub fn load<T>(db: &T) -> store::Result<Self>
    where
        T: for<'x> Store<'x> + 'static,
    {
        let mut fsm = Fsm::default();

        for (key, value) in db.iterator(Table::Catalog, &[], Direction::Forward)? {
            match key.first() {
                Some(&CatalogKey::TOPIC_KEY_PREFIX) => {
                    let topic = Topic::deserialize(&value).ok_or_else(|| {
                        StoreError::DataCorruption("Corrupted topic record.".to_string())
                    })?;
                    fsm.topics.insert(topic.topic_id, topic);
                }
                Some(&CatalogKey::DATASET_KEY_PREFIX) => {
                    let dataset = DatasetRecord::deserialize(&value).ok_or_else(|| {
                        StoreError::DataCorruption("Corrupted dataset record.".to_string())
                    })?;
                    fsm.datasets
                        .insert((dataset.topic_id, dataset.dataset_id), dataset);
                }
                _ => {
                    return Err(StoreError::DataCorruption(
                        "Unexpected catalog key prefix.".to_string(),
                    ));
                }
            }
        }

        for (_, value) in db.iterator(Table::Jobs, &[], Direction::Forward)? {
            let job = JobRecord::deserialize(&value).ok_or_else(|| {
                StoreError::DataCorruption("Corrupted job record.".to_string())
            })?;
            fsm.jobs.insert(job.job_id.clone(), job);
        }

        for (_, value) in db.iterator(Table::Config, &[], Direction::Forward)? {
            let entry = ConfigEntry::deserialize(&value).ok_or_else(|| {
                StoreError::DataCorruption("Corrupted config entry.".to_string())
            })?;
            fsm.config.insert(entry.key.clone(), entry);
        }

        for (key, value) in db.iterator(Table::Membership, &[], Direction::Forward)? {
            match key.first() {
                Some(&MEMBER_KEY_PREFIX) => {
                    let member = ClusterMember::deserialize(&value).ok_or_else(|| {
                        StoreError::DataCorruption("Corrupted member record.".to_string())
                    })?;
                    fsm.members.insert(member.node_id, member);
                }
                Some(&TOKEN_KEY_PREFIX) => {
                    let token = JoinToken::deserialize(&value).ok_or_else(|| {
                        StoreError::DataCorruption("Corrupted join token.".to_string())
                    })?;
                    fsm.tokens.insert(token.token.clone(), token);
                }
                _ => {
                    return Err(StoreError::DataCorruption(
                        "Unexpected membership key prefix.".to_string(),
                    ));
                }
            }
        }

        fsm.rebuild_indexes();
        Ok(fsm)
    }

    fn rebuild_indexes(&mut self) {
        self.topics_by_name = self
            .topics
            .values()
            .map(|topic| (topic.name.clone(), topic.topic_id))
            .collect();
    }

    /// Applies one committed command, mutating the in-memory sections and
    /// returning the corresponding durable write batch. Unknown targets are
    /// ignored with a warning: the leader validates before proposing, and
    /// every replica must take the same branch regardless.
    pub fn apply(&mut self, command: Command) -> store::Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();

        match command {
            Command::TopicUpsert(topic) => {
                outcome.ops.push(WriteOperation::set(
                    Table::Catalog,
                    CatalogKey::serialize_topic(&topic.topic_id),
                    serialize_record(&topic)?,
                ));
                outcome.event = Some(ApplyEvent::CatalogChanged {
                    topic_id: topic.topic_id,
                });
                self.topics_by_name
                    .insert(topic.name.clone(), topic.topic_id);
                self.topics.insert(topic.topic_id, topic);
            }
            Command::TopicDelete { topic_id } => {
                if let Some(topic) = self.topics.remove(&topic_id) {
                    self.topics_by_name.remove(&topic.name);
                    outcome.ops.push(WriteOperation::delete(
                        Table::Catalog,
                        CatalogKey::serialize_topic(&topic_id),
                    ));

                    // Deleting a topic deletes its datasets.
                    let dataset_ids = self
                        .datasets
                        .range((topic_id, Uuid::nil())..=(topic_id, Uuid::max()))
                        .map(|((_, dataset_id), _)| *dataset_id)
                        .collect::<Vec<_>>();
                    for dataset_id in dataset_ids {
                        self.datasets.remove(&(topic_id, dataset_id));
                        outcome.ops.push(WriteOperation::delete(
                            Table::Catalog,
                            CatalogKey::serialize_dataset(&topic_id, &dataset_id),
                        ));
                    }
                    outcome.event = Some(ApplyEvent::CatalogChanged { topic_id });
                } else {
                    warn!("TopicDelete for unknown topic {}.", topic_id);
                }
            }
            Command::CatalogUpsert(dataset) => {
                if !dataset.is_well_formed() {
                    warn!(
                        "Ignoring malformed dataset record {} (content hash mismatch).",
                        dataset.dataset_id
                    );
                } else {
                    outcome.ops.push(WriteOperation::set(
                        Table::Catalog,
                        CatalogKey::serialize_dataset(&dataset.topic_id, &dataset.dataset_id),
                        serialize_record(&dataset)?,
                    ));
                    outcome.event = Some(ApplyEvent::CatalogChanged {
                        topic_id: dataset.topic_id,
                    });
                    self.datasets
                        .insert((dataset.topic_id, dataset.dataset_id), dataset);
                }
            }
            Command::CatalogDelete {
                topic_id,
                dataset_id,
            } => {
                if self.datasets.remove(&(topic_id, dataset_id)).is_some() {
                    outcome.ops.push(WriteOperation::delete(
                        Table::Catalog,
                        CatalogKey::serialize_dataset(&topic_id, &dataset_id),
                    ));
                    outcome.event = Some(ApplyEvent::CatalogChanged { topic_id });
                } else {
                    warn!("CatalogDelete for unknown dataset {}.", dataset_id);
                }
            }
            Command::JobUpsert(job) => {
                outcome.ops.push(WriteOperation::set(
                    Table::Jobs,
                    job.job_id.as_bytes().to_vec(),
                    serialize_record(&job)?,
                ));
                outcome.event = Some(ApplyEvent::JobsChanged {
                    job_id: job.job_id.clone(),
                });
                self.jobs.insert(job.job_id.clone(), job);
            }
            Command::JobAssign { job_id, node_id } => {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.status = JobStatus::Assigned;
                    job.assigned_node = Some(node_id);
                    outcome.ops.push(WriteOperation::set(
                        Table::Jobs,
                        job_id.as_bytes().to_vec(),
                        serialize_record(job)?,
                    ));
                    outcome.event = Some(ApplyEvent::JobsChanged { job_id });
                } else {
                    warn!("JobAssign for unknown job {}.", job_id);
                }
            }
            Command::JobTerminate { job_id, status } => {
                if !status.is_terminal() {
                    warn!("JobTerminate with non-terminal status for {}.", job_id);
                } else if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.status = status;
                    outcome.ops.push(WriteOperation::set(
                        Table::Jobs,
                        job_id.as_bytes().to_vec(),
                        serialize_record(job)?,
                    ));
                    outcome.event = Some(ApplyEvent::JobsChanged { job_id });
                } else {
                    warn!("JobTerminate for unknown job {}.", job_id);
                }
            }
            Command::ConfigSet { key, value } => {
                let version = self
                    .config
                    .get(&key)
                    .map(|entry| entry.version + 1)
                    .unwrap_or(1);
                let entry = ConfigEntry {
                    key: key.clone(),
                    value,
                    version,
                };
                outcome.ops.push(WriteOperation::set(
                    Table::Config,
                    key.as_bytes().to_vec(),
                    serialize_record(&entry)?,
                ));
                outcome.event = Some(ApplyEvent::ConfigChanged { key: key.clone() });
                self.config.insert(key, entry);
            }
            Command::ConfigDelete { key } => {
                if self.config.remove(&key).is_some() {
                    outcome.ops.push(WriteOperation::delete(
                        Table::Config,
                        key.as_bytes().to_vec(),
                    ));
                    outcome.event = Some(ApplyEvent::ConfigChanged { key });
                } else {
                    warn!("ConfigDelete for unknown key '{}'.", key);
                }
            }
            Command::MemberAdd(member) => {
                outcome.ops.push(WriteOperation::set(
                    Table::Membership,
                    member_key(member.node_id),
                    serialize_record(&member)?,
                ));
                outcome.event = Some(ApplyEvent::MembershipChanged);
                self.members.insert(member.node_id, member);
            }
            Command::MemberRemove { node_id, force: _ } => {
                if self.members.remove(&node_id).is_some() {
                    outcome
                        .ops
                        .push(WriteOperation::delete(Table::Membership, member_key(node_id)));
                    outcome.event = Some(ApplyEvent::MembershipChanged);
                } else {
                    warn!("MemberRemove for unknown node {}.", node_id);
                }
            }
            Command::MemberChangeRole { node_id, role } => {
                if let Some(member) = self.members.get_mut(&node_id) {
                    member.role = role;
                    outcome.ops.push(WriteOperation::set(
                        Table::Membership,
                        member_key(node_id),
                        serialize_record(member)?,
                    ));
                    outcome.event = Some(ApplyEvent::MembershipChanged);
                } else {
                    warn!("MemberChangeRole for unknown node {}.", node_id);
                }
            }
            Command::JoinTokenCreate(token) => {
                outcome.ops.push(WriteOperation::set(
                    Table::Membership,
                    token_key(&token.token),
                    serialize_record(&token)?,
                ));
                self.tokens.insert(token.token.clone(), token);
            }
            Command::JoinTokenConsume { token } => {
                if let Some(record) = self.tokens.get_mut(&token) {
                    record.used = true;
                    outcome.ops.push(WriteOperation::set(
                        Table::Membership,
                        token_key(&token),
                        serialize_record(record)?,
                    ));
                } else {
                    warn!("JoinTokenConsume for unknown token.");
                }
            }
        }

        Ok(outcome)
    }

    /// Serializes the four sections. BTreeMap iteration is ordered, so two
    /// replicas at the same applied index produce identical bytes.
    pub fn snapshot(&self) -> store::Result<Vec<u8>> {
        store::bincode::serialize(self)
            .map_err(|e| StoreError::SerializeError(format!("Failed to serialize FSM: {}", e)))
    }

    /// Replaces the entire state with a snapshot payload and returns the
    /// write batch that rebuilds the durable tables from scratch.
    pub fn restore(&mut self, payload: &[u8]) -> store::Result<Vec<WriteOperation>> {
        let mut fsm: Fsm = store::bincode::deserialize(payload)
            .map_err(|e| StoreError::DeserializeError(format!("Corrupted FSM snapshot: {}", e)))?;
        fsm.rebuild_indexes();
        *self = fsm;

        let mut ops = Vec::new();
        for topic in self.topics.values() {
            ops.push(WriteOperation::set(
                Table::Catalog,
                CatalogKey::serialize_topic(&topic.topic_id),
                serialize_record(topic)?,
            ));
        }
        for dataset in self.datasets.values() {
            ops.push(WriteOperation::set(
                Table::Catalog,
                CatalogKey::serialize_dataset(&dataset.topic_id, &dataset.dataset_id),
                serialize_record(dataset)?,
            ));
        }
        for job in self.jobs.values() {
            ops.push(WriteOperation::set(
                Table::Jobs,
                job.job_id.as_bytes().to_vec(),
                serialize_record(job)?,
            ));
        }
        for entry in self.config.values() {
            ops.push(WriteOperation::set(
                Table::Config,
                entry.key.as_bytes().to_vec(),
                serialize_record(entry)?,
            ));
        }
        for member in self.members.values() {
            ops.push(WriteOperation::set(
                Table::Membership,
                member_key(member.node_id),
                serialize_record(member)?,
            ));
        }
        for token in self.tokens.values() {
            ops.push(WriteOperation::set(
                Table::Membership,
                token_key(&token.token),
                serialize_record(token)?,
            ));
        }
        Ok(ops)
    }

    // Queries. Readers hold the FSM read lock; none of these touch the
    // durable backend.

    pub fn topic(&self, topic_id: &TopicId) -> Option<&Topic> {
        self.topics.get(topic_id)
    }

    pub fn topic_by_name(&self, name: &str) -> Option<&Topic> {
        self.topics_by_name
            .get(name)
            .and_then(|topic_id| self.topics.get(topic_id))
    }

    pub fn list_topics(&self) -> Vec<&Topic> {
        self.topics.values().collect()
    }

    pub fn dataset(&self, topic_id: &TopicId, dataset_id: &DatasetId) -> Option<&DatasetRecord> {
        self.datasets.get(&(*topic_id, *dataset_id))
    }

    pub fn list_datasets(&self, topic_id: &TopicId) -> Vec<&DatasetRecord> {
        self.datasets
            .range((*topic_id, Uuid::nil())..=(*topic_id, Uuid::max()))
            .map(|(_, dataset)| dataset)
            .collect()
    }

    /// Returns catalog entries strictly after the cursor in
    /// `(updated_at, topic_id, dataset_id)` order, which makes resumption
    /// deterministic for the sync protocol.
    pub fn datasets_after(
        &self,
        topic_id: Option<TopicId>,
        cursor: &SyncCursor,
        limit: usize,
    ) -> Vec<DatasetRecord> {
        let mut entries = self
            .datasets
            .values()
            .filter(|dataset| topic_id.map_or(true, |topic_id| dataset.topic_id == topic_id))
            .filter(|dataset| {
                (dataset.updated_at, dataset.topic_id, dataset.dataset_id)
                    > (cursor.updated_at, cursor.topic_id, cursor.dataset_id)
            })
            .cloned()
            .collect::<Vec<_>>();
        entries.sort_by_key(|dataset| (dataset.updated_at, dataset.topic_id, dataset.dataset_id));
        entries.truncate(limit);
        entries
    }

    pub fn job(&self, job_id: &str) -> Option<&JobRecord> {
        self.jobs.get(job_id)
    }

    pub fn list_jobs(&self) -> Vec<&JobRecord> {
        self.jobs.values().collect()
    }

    pub fn jobs_for_node(&self, node_id: NodeId) -> Vec<&JobRecord> {
        self.jobs
            .values()
            .filter(|job| job.assigned_node == Some(node_id) && !job.status.is_terminal())
            .collect()
    }

    pub fn config_get(&self, key: &str) -> Option<&ConfigEntry> {
        self.config.get(key)
    }

    pub fn member(&self, node_id: NodeId) -> Option<&ClusterMember> {
        self.members.get(&node_id)
    }

    pub fn list_members(&self) -> Vec<&ClusterMember> {
        self.members.values().collect()
    }

    pub fn voters(&self) -> Vec<NodeId> {
        self.members
            .values()
            .filter(|member| member.is_voter())
            .map(|member| member.node_id)
            .collect()
    }

    pub fn token(&self, token: &str) -> Option<&JoinToken> {
        self.tokens.get(token)
    }
}

fn serialize_record<U: StoreSerialize>(record: &U) -> store::Result<Vec<u8>> {
    record.serialize().ok_or_else(|| {
        StoreError::SerializeError("Failed to serialize FSM record.".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChunkRef, MemberState};
    use store::blob::{content_hash, ChunkHash};

    fn dataset(topic_id: TopicId, name: &str, updated_at: u64) -> DatasetRecord {
        let chunks = vec![
            ChunkRef {
                hash: ChunkHash::of(format!("{} chunk 0", name).as_bytes()),
                size: 1024,
            },
            ChunkRef {
                hash: ChunkHash::of(format!("{} chunk 1", name).as_bytes()),
                size: 512,
            },
        ];
        DatasetRecord {
            dataset_id: Uuid::new_v4(),
            topic_id,
            name: name.to_string(),
            size: 1536,
            content_hash: content_hash(&[chunks[0].hash, chunks[1].hash]),
            chunk_count: 2,
            chunks,
            owner_peer_id: vec![7],
            metadata: Vec::new(),
            updated_at,
        }
    }

    fn commands() -> Vec<Command> {
        let topic_id = Uuid::from_u128(1);
        let topic = Topic {
            topic_id,
            name: "oceanography".to_string(),
            schema: b"{}".to_vec(),
            owner_peer_id: vec![1],
            created_at: 100,
        };
        vec![
            Command::TopicUpsert(topic),
            Command::CatalogUpsert(dataset(topic_id, "salinity", 1)),
            Command::ConfigSet {
                key: "greeting".to_string(),
                value: b"hi".to_vec(),
            },
            Command::ConfigSet {
                key: "greeting".to_string(),
                value: b"hello".to_vec(),
            },
            Command::JobUpsert(JobRecord {
                job_id: "job-1".to_string(),
                job_type: "ingest".to_string(),
                status: JobStatus::Pending,
                priority: 5,
                assigned_node: None,
                metadata: Vec::new(),
            }),
            Command::JobAssign {
                job_id: "job-1".to_string(),
                node_id: 2,
            },
            Command::MemberAdd(ClusterMember {
                node_id: 1,
                raft_address: "127.0.0.1:7911".to_string(),
                peer_id: vec![1],
                role: MemberRole::Voter,
                state: MemberState::Stable,
                joined_at: 100,
            }),
        ]
    }

    #[test]
    fn apply_is_deterministic() {
        let mut a = Fsm::default();
        let mut b = Fsm::default();
        for command in commands() {
            a.apply(command.clone()).unwrap();
            b.apply(command).unwrap();
        }
        assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
    }

    #[test]
    fn snapshot_round_trip() {
        let mut fsm = Fsm::default();
        for command in commands() {
            fsm.apply(command).unwrap();
        }
        let snapshot = fsm.snapshot().unwrap();

        let mut restored = Fsm::default();
        let ops = restored.restore(&snapshot).unwrap();
        assert!(!ops.is_empty());
        assert_eq!(restored.snapshot().unwrap(), snapshot);
        assert_eq!(
            restored.topic_by_name("oceanography").unwrap().topic_id,
            Uuid::from_u128(1)
        );
    }

    #[test]
    fn config_versions_increment() {
        let mut fsm = Fsm::default();
        for command in commands() {
            fsm.apply(command).unwrap();
        }
        let entry = fsm.config_get("greeting").unwrap();
        assert_eq!(entry.value, b"hello".to_vec());
        assert_eq!(entry.version, 2);
    }

    #[test]
    fn join_token_single_use() {
        let mut fsm = Fsm::default();
        fsm.apply(Command::JoinTokenCreate(JoinToken {
            token: "t1".to_string(),
            cluster_name: "lab".to_string(),
            leader_address: "127.0.0.1:7911".to_string(),
            expires_at: i64::MAX,
            used: false,
        }))
        .unwrap();

        assert!(!fsm.token("t1").unwrap().used);
        fsm.apply(Command::JoinTokenConsume {
            token: "t1".to_string(),
        })
        .unwrap();
        assert!(fsm.token("t1").unwrap().used);
    }

    #[test]
    fn malformed_dataset_is_ignored() {
        let mut fsm = Fsm::default();
        let topic_id = Uuid::from_u128(9);
        let mut record = dataset(topic_id, "tampered", 1);
        record.content_hash = ChunkHash::of(b"wrong");

        let outcome = fsm.apply(Command::CatalogUpsert(record)).unwrap();
        assert!(outcome.ops.is_empty());
        assert!(fsm.list_datasets(&topic_id).is_empty());
    }

    #[test]
    fn topic_delete_cascades() {
        let mut fsm = Fsm::default();
        let topic_id = Uuid::from_u128(3);
        fsm.apply(Command::TopicUpsert(Topic {
            topic_id,
            name: "geology".to_string(),
            schema: Vec::new(),
            owner_peer_id: Vec::new(),
            created_at: 1,
        }))
        .unwrap();
        fsm.apply(Command::CatalogUpsert(dataset(topic_id, "cores", 2)))
            .unwrap();

        let outcome = fsm
            .apply(Command::TopicDelete { topic_id })
            .unwrap();
        assert_eq!(outcome.ops.len(), 2);
        assert!(fsm.topic(&topic_id).is_none());
        assert!(fsm.list_datasets(&topic_id).is_empty());
        assert!(fsm.topic_by_name("geology").is_none());
    }

    #[test]
    fn sync_cursor_orders_deterministically() {
        let mut fsm = Fsm::default();
        let topic_id = Uuid::from_u128(5);
        fsm.apply(Command::TopicUpsert(Topic {
            topic_id,
            name: "astro".to_string(),
            schema: Vec::new(),
            owner_peer_id: Vec::new(),
            created_at: 1,
        }))
        .unwrap();
        for (name, updated_at) in [("a", 3u64), ("b", 1), ("c", 2), ("d", 2)] {
            fsm.apply(Command::CatalogUpsert(dataset(topic_id, name, updated_at)))
                .unwrap();
        }

        let mut cursor = SyncCursor::default();
        let mut seen = Vec::new();
        loop {
            let page = fsm.datasets_after(Some(topic_id), &cursor, 2);
            if page.is_empty() {
                break;
            }
            for record in page {
                cursor = SyncCursor {
                    updated_at: record.updated_at,
                    topic_id: record.topic_id,
                    dataset_id: record.dataset_id,
                };
                seen.push(record.updated_at);
            }
        }

        assert_eq!(seen.len(), 4);
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted);
    }
}

/// Resumable position in the catalog sync order.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub struct SyncCursor {
    pub updated_at: u64,
    pub topic_id: TopicId,
    pub dataset_id: DatasetId,
}
