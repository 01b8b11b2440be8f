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

use super::ReplicationEngine;
use catalog::fsm::{Command, SyncCursor};
use catalog::{DatasetRecord, TopicId};
use p2p::types::{SyncRequest, SyncResponse};
use p2p::PeerId;
use store::tracing::{debug, info, warn};
use store::Store;

impl<T> ReplicationEngine<T>
where
    T: for<'x> Store<'x> + 'static,
{
    /// One replication pass over the subscribed topics: bring the catalog
    /// mirror up to the providers' watermark, then fetch missing chunks.
    pub async fn sync_and_fetch(&mut self) {
        let topics = self.subscriptions.iter().copied().collect::<Vec<_>>();

        if !self.is_cluster_member() {
            for topic_id in &topics {
                self.sync_topic(*topic_id).await;
            }
        }

        for topic_id in &topics {
            self.fetch_topic_datasets(*topic_id).await;
        }
    }

    /// Runs `/bib/sync/1` for one topic against the best reachable peers.
    /// The cursor resumes from the newest locally mirrored entry.
    pub async fn sync_topic(&mut self, topic_id: TopicId) {
        let mut sources = match self.handle.connected_peers().await {
            Ok(peers) => peers,
            Err(_) => return,
        };
        self.peer_store.preferred_order(&mut sources);
        if sources.is_empty() {
            debug!("No peers available to sync topic {}.", topic_id);
            return;
        }

        let mut cursor = {
            let fsm = self.core.fsm.read();
            fsm.list_datasets(&topic_id)
                .iter()
                .map(|record| SyncCursor {
                    updated_at: record.updated_at,
                    topic_id: record.topic_id,
                    dataset_id: record.dataset_id,
                })
                .max_by_key(|cursor| (cursor.updated_at, cursor.topic_id, cursor.dataset_id))
                .unwrap_or_default()
        };

        'sources: for peer in sources {
            loop {
                let response = self
                    .handle
                    .request_sync(
                        peer,
                        SyncRequest {
                            topic_id: Some(topic_id),
                            cursor,
                            limit: 128,
                        },
                    )
                    .await;

                match response {
                    Ok(SyncResponse::Entries {
                        entries,
                        authoritative,
                        done,
                    }) => {
                        if !authoritative {
                            // A cache must never be treated as a source of
                            // truth; keep looking for an authoritative peer.
                            debug!("Peer {} is not authoritative for sync.", peer);
                            continue 'sources;
                        }
                        for record in &entries {
                            cursor = SyncCursor {
                                updated_at: record.updated_at,
                                topic_id: record.topic_id,
                                dataset_id: record.dataset_id,
                            };
                        }
                        if let Err(e) = self.mirror_entries(entries) {
                            warn!("Failed to mirror catalog entries: {}", e);
                            return;
                        }
                        if done {
                            return;
                        }
                    }
                    Ok(SyncResponse::Busy) | Err(_) => {
                        continue 'sources;
                    }
                }
            }
        }
    }

    /// Writes synced records through the same apply path the FSM uses, so
    /// the durable mirror and the in-memory catalog stay in lockstep.
    fn mirror_entries(&self, entries: Vec<DatasetRecord>) -> store::Result<()> {
        let mut fsm = self.core.fsm.write();
        let mut ops = Vec::new();
        for record in entries {
            ops.extend(fsm.apply(Command::CatalogUpsert(record))?.ops);
        }
        drop(fsm);
        if !ops.is_empty() {
            self.core.store.db.write(ops)?;
        }
        Ok(())
    }

    /// Ensures the mirror knows a topic that was discovered remotely.
    pub fn mirror_topic(&self, topic: catalog::Topic) -> store::Result<()> {
        let mut fsm = self.core.fsm.write();
        if fsm.topic(&topic.topic_id).is_some() {
            return Ok(());
        }
        let ops = fsm.apply(Command::TopicUpsert(topic))?.ops;
        drop(fsm);
        self.core.store.db.write(ops)
    }

    /// Fetches every incomplete dataset of a topic from its providers.
    pub async fn fetch_topic_datasets(&mut self, topic_id: TopicId) {
        let datasets = {
            let fsm = self.core.fsm.read();
            fsm.list_datasets(&topic_id)
                .into_iter()
                .cloned()
                .collect::<Vec<_>>()
        };

        for record in datasets {
            match self.transfer.is_complete(&record) {
                Ok(true) => continue,
                Ok(false) => (),
                Err(e) => {
                    warn!("Failed to check dataset {}: {}", record.dataset_id, e);
                    continue;
                }
            }

            let providers = self.dataset_providers(&record).await;
            if providers.is_empty() {
                debug!("No providers for dataset {}.", record.dataset_id);
                continue;
            }

            match self.transfer.fetch_dataset(&record, providers).await {
                Ok(true) => {
                    info!(
                        "Dataset '{}' ({}) replicated completely.",
                        record.name, record.dataset_id
                    );
                    self.advertise_dataset(&record).await;
                }
                Ok(false) => (),
                Err(e) if e.is_transient() => {
                    debug!(
                        "Transfer of dataset {} interrupted: {}; will resume.",
                        record.dataset_id, e
                    );
                }
                Err(e) => {
                    warn!("Transfer of dataset {} failed: {}", record.dataset_id, e);
                }
            }
        }
    }

    /// Provider discovery: DHT records first, connected peers as fallback.
    async fn dataset_providers(&self, record: &DatasetRecord) -> Vec<PeerId> {
        let mut providers = self
            .handle
            .get_providers(record.content_hash.as_bytes().to_vec())
            .await
            .unwrap_or_default();
        if providers.is_empty() {
            providers = self.handle.connected_peers().await.unwrap_or_default();
        }
        providers.retain(|peer| *peer != self.handle.peer_id());
        providers
    }

    /// Completed datasets become provider records, but only from nodes
    /// whose backend may act as a source of truth.
    async fn advertise_dataset(&self, record: &DatasetRecord) {
        if self.core.store.is_authoritative() {
            self.handle
                .start_providing(record.content_hash.as_bytes().to_vec())
                .await
                .ok();
        }
    }

}
