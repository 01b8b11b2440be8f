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
use catalog::{DatasetRecord, TopicId};
use p2p::types::{DiscoveryRequest, DiscoveryResponse};
use p2p::PeerId;
use std::time::{Duration, Instant};
use store::ahash::AHashMap;
use store::tracing::debug;
use store::Store;

/// In-memory TTL cache for proxied catalog lookups. A proxy node holds no
/// durable catalog or chunks and never advertises availability.
pub struct ProxyCache {
    datasets: AHashMap<TopicId, (Instant, Vec<DatasetRecord>)>,
    ttl: Duration,
}

impl ProxyCache {
    pub fn new(ttl: Duration) -> Self {
        ProxyCache {
            datasets: AHashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, topic_id: &TopicId) -> Option<&Vec<DatasetRecord>> {
        self.datasets.get(topic_id).and_then(|(stored_at, records)| {
            if stored_at.elapsed() < self.ttl {
                Some(records)
            } else {
                None
            }
        })
    }

    pub fn put(&mut self, topic_id: TopicId, records: Vec<DatasetRecord>) {
        self.datasets.insert(topic_id, (Instant::now(), records));
    }

    pub fn evict_expired(&mut self) {
        let ttl = self.ttl;
        self.datasets
            .retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
    }

    pub fn clear(&mut self) {
        self.datasets.clear();
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

impl<T> ReplicationEngine<T>
where
    T: for<'x> Store<'x> + 'static,
{
    /// Proxy lookup path: answer from the TTL cache, otherwise forward to
    /// the first favorite (or best-reputation) peer that responds.
    pub async fn proxy_list_datasets(
        &mut self,
        topic_id: TopicId,
    ) -> Option<Vec<DatasetRecord>> {
        if let Some(records) = self.proxy_cache.get(&topic_id) {
            return Some(records.clone());
        }

        let mut upstreams = self.proxy_upstreams().await;
        self.peer_store.preferred_order(&mut upstreams);

        for peer in upstreams {
            let mut page = 0;
            let mut records = Vec::new();
            loop {
                match self
                    .handle
                    .request_discovery(peer, DiscoveryRequest::ListDatasets { topic_id, page })
                    .await
                {
                    Ok(DiscoveryResponse::Datasets { datasets, done, .. }) => {
                        records.extend(datasets);
                        if done {
                            self.proxy_cache.put(topic_id, records.clone());
                            return Some(records);
                        }
                        page += 1;
                    }
                    Ok(_) | Err(_) => {
                        debug!("Proxy upstream {} failed for topic {}.", peer, topic_id);
                        break;
                    }
                }
            }
        }
        None
    }

    async fn proxy_upstreams(&self) -> Vec<PeerId> {
        self.handle.connected_peers().await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::uuid::Uuid;

    #[test]
    fn cache_expires_entries() {
        let mut cache = ProxyCache::new(Duration::from_millis(0));
        let topic_id = Uuid::new_v4();
        cache.put(topic_id, Vec::new());

        // TTL of zero: immediately expired.
        std::thread::sleep(Duration::from_millis(1));
        assert!(cache.get(&topic_id).is_none());
        cache.evict_expired();
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_serves_fresh_entries() {
        let mut cache = ProxyCache::new(Duration::from_secs(60));
        let topic_id = Uuid::new_v4();
        cache.put(topic_id, Vec::new());
        assert!(cache.get(&topic_id).is_some());
        assert_eq!(cache.len(), 1);
    }
}
