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

use std::sync::Arc;

use catalog::DatasetRecord;
use futures::stream::{FuturesUnordered, StreamExt};
use libp2p::PeerId;
use store::ahash::{AHashMap, AHashSet};
use store::blob::{content_hash, ChunkHash, ChunkStore};
use store::roaring::RoaringBitmap;
use store::serialize::key::SystemKey;
use store::serialize::StoreSerialize;
use store::tracing::{debug, warn};
use store::uuid::Uuid;
use store::{BibStore, Store, StoreError, Table};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::P2pConfig;
use crate::error::P2pError;
use crate::node::P2pHandle;
use crate::peer_store::PeerStore;
use crate::types::{DataRequest, DataResponse};

/// How many consecutive failures a provider may accrue within one transfer
/// before it is dropped from the provider set.
const MAX_PEER_STRIKES: u32 = 3;

/// Loads the persisted bitmap of verified chunk indexes for a dataset. The
/// bitmap survives restarts so an interrupted transfer resumes without
/// re-downloading anything already verified.
pub fn load_chunk_bitmap<T>(store: &BibStore<T>, dataset_id: &Uuid) -> store::Result<RoaringBitmap>
where
    T: for<'x> Store<'x> + 'static,
{
    Ok(store
        .db
        .get(Table::System, &SystemKey::serialize_chunk_bitmap(dataset_id))?
        .unwrap_or_default())
}

pub fn persist_chunk_bitmap<T>(
    store: &BibStore<T>,
    dataset_id: &Uuid,
    bitmap: &RoaringBitmap,
) -> store::Result<()>
where
    T: for<'x> Store<'x> + 'static,
{
    store.db.set(
        Table::System,
        &SystemKey::serialize_chunk_bitmap(dataset_id),
        &bitmap.serialize().ok_or_else(|| {
            StoreError::SerializeError("Failed to serialize chunk bitmap.".to_string())
        })?,
    )
}

pub fn clear_chunk_bitmap<T>(store: &BibStore<T>, dataset_id: &Uuid) -> store::Result<()>
where
    T: for<'x> Store<'x> + 'static,
{
    store
        .db
        .delete(Table::System, &SystemKey::serialize_chunk_bitmap(dataset_id))
}

/// Picks the next batch: the lowest missing chunk indexes go to the least
/// loaded provider that still has fan-out headroom.
pub fn next_assignment(
    missing: &[u32],
    load: &AHashMap<PeerId, usize>,
    providers: &[PeerId],
    fan_out_per_peer: usize,
    batch_size: usize,
) -> Option<(PeerId, Vec<u32>)> {
    if missing.is_empty() {
        return None;
    }
    let peer = providers
        .iter()
        .map(|peer| (*peer, load.get(peer).copied().unwrap_or(0)))
        .filter(|(_, outstanding)| *outstanding < fan_out_per_peer)
        .min_by_key(|(_, outstanding)| *outstanding)
        .map(|(peer, _)| peer)?;
    Some((peer, missing.iter().take(batch_size).copied().collect()))
}

pub struct Transfer<T>
where
    T: for<'x> Store<'x> + 'static,
{
    store: Arc<BibStore<T>>,
    peers: Arc<PeerStore>,
    handle: P2pHandle,
    /// Byte-denominated budget shared by every concurrent transfer on this
    /// node; requests block here before going on the wire.
    budget: Arc<Semaphore>,
    budget_bytes: u64,
    fan_out_per_peer: usize,
    max_frames_per_request: u32,
}

impl<T> Transfer<T>
where
    T: for<'x> Store<'x> + 'static,
{
    pub fn new(
        store: Arc<BibStore<T>>,
        peers: Arc<PeerStore>,
        handle: P2pHandle,
        config: &P2pConfig,
    ) -> Self {
        let budget_bytes = config.outstanding_bytes_budget.max(config.chunk_size as u64);
        Transfer {
            store,
            peers,
            handle,
            budget: Arc::new(Semaphore::new(budget_bytes as usize)),
            budget_bytes,
            fan_out_per_peer: config.fan_out_per_peer.max(1),
            max_frames_per_request: config.max_frames_per_request.max(1),
        }
    }

    pub fn is_complete(&self, record: &DatasetRecord) -> store::Result<bool> {
        Ok(load_chunk_bitmap(&self.store, &record.dataset_id)?.len() as u32
            >= record.chunk_count)
    }

    /// Fetches every missing chunk of `record` from `providers` in
    /// parallel. Returns `Ok(true)` when the dataset reached completion in
    /// this call, `Ok(false)` when it was already complete.
    pub async fn fetch_dataset(
        &self,
        record: &DatasetRecord,
        mut providers: Vec<PeerId>,
    ) -> Result<bool, P2pError> {
        let mut verified = load_chunk_bitmap(&self.store, &record.dataset_id)?;
        if verified.len() as u32 >= record.chunk_count {
            return Ok(false);
        }

        self.peers.preferred_order(&mut providers);
        if providers.is_empty() {
            return Err(P2pError::NoProviders);
        }

        let mut missing: Vec<u32> = (0..record.chunk_count)
            .filter(|index| !verified.contains(*index))
            .collect();
        let mut load: AHashMap<PeerId, usize> = AHashMap::new();
        let mut strikes: AHashMap<PeerId, u32> = AHashMap::new();
        let mut in_flight: AHashSet<u32> = AHashSet::new();

        type BatchResult = (
            PeerId,
            Vec<u32>,
            OwnedSemaphorePermit,
            Result<DataResponse, P2pError>,
        );
        let mut requests: FuturesUnordered<
            std::pin::Pin<Box<dyn std::future::Future<Output = BatchResult> + Send>>,
        > = FuturesUnordered::new();

        loop {
            // Schedule as long as providers have headroom.
            while let Some((peer, batch)) = next_assignment(
                &missing,
                &load,
                &providers,
                self.fan_out_per_peer,
                self.max_frames_per_request as usize,
            ) {
                let reserve = self.batch_bytes(record, &batch);
                // Outstanding-bytes budget: when it is exhausted, stop
                // scheduling until an in-flight request completes and
                // releases its reservation.
                let permit = match self.budget.clone().try_acquire_many_owned(reserve) {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let mut wanted = RoaringBitmap::new();
                for index in &batch {
                    wanted.insert(*index);
                    in_flight.insert(*index);
                }
                missing.retain(|index| !in_flight.contains(index));
                *load.entry(peer).or_insert(0) += 1;

                let request = DataRequest {
                    dataset_id: record.dataset_id,
                    wanted: wanted.serialize().ok_or_else(|| {
                        StoreError::SerializeError("Failed to serialize bitmap.".to_string())
                    })?,
                    max_frames: self.max_frames_per_request,
                };
                let handle = self.handle.clone();
                requests.push(Box::pin(async move {
                    let response = handle.request_data(peer, request).await;
                    (peer, batch, permit, response)
                }));
            }

            let (peer, batch, permit, response) = match requests.next().await {
                Some(result) => result,
                None => {
                    if missing.is_empty() && in_flight.is_empty() {
                        break;
                    }
                    // Requests can no longer be scheduled: every provider is
                    // struck out or over its fan-out with nothing in flight.
                    return Err(P2pError::NoProviders);
                }
            };
            drop(permit);
            if let Some(outstanding) = load.get_mut(&peer) {
                *outstanding = outstanding.saturating_sub(1);
            }

            let mut delivered: AHashSet<u32> = AHashSet::new();
            match response {
                Ok(DataResponse::Chunks { frames }) => {
                    let mut tainted = false;
                    for frame in frames {
                        if !batch.contains(&frame.chunk_index) {
                            continue;
                        }
                        let expected = record.chunks[frame.chunk_index as usize].hash;
                        if frame.hash != expected || ChunkHash::of(&frame.bytes) != expected {
                            warn!(
                                "Chunk {} of {} from {} failed verification.",
                                frame.chunk_index, record.dataset_id, peer
                            );
                            tainted = true;
                            continue;
                        }
                        self.store.chunks.put_chunk(&expected, &frame.bytes)?;
                        verified.insert(frame.chunk_index);
                        delivered.insert(frame.chunk_index);
                    }
                    persist_chunk_bitmap(&self.store, &record.dataset_id, &verified)?;

                    if tainted {
                        self.peers.record_integrity_failure(&peer);
                        *strikes.entry(peer).or_insert(0) += 1;
                    } else if !delivered.is_empty() {
                        self.peers.record_success(&peer);
                        strikes.remove(&peer);
                    } else {
                        // The peer had none of the requested chunks.
                        *strikes.entry(peer).or_insert(0) += 1;
                    }
                }
                Ok(DataResponse::UnknownDataset) | Ok(DataResponse::Busy) => {
                    *strikes.entry(peer).or_insert(0) += 1;
                }
                Err(e) => {
                    debug!("Chunk request to {} failed: {}", peer, e);
                    *strikes.entry(peer).or_insert(0) += 1;
                }
            }

            if strikes.get(&peer).copied().unwrap_or(0) >= MAX_PEER_STRIKES {
                providers.retain(|provider| provider != &peer);
                load.remove(&peer);
            }

            // Undelivered chunks return to the missing pool for another
            // provider.
            for index in batch {
                in_flight.remove(&index);
                if !delivered.contains(&index) && !verified.contains(index) {
                    missing.push(index);
                }
            }
            missing.sort_unstable();
            missing.dedup();

            if verified.len() as u32 >= record.chunk_count {
                break;
            }
            if providers.is_empty() {
                return Err(P2pError::NoProviders);
            }
        }

        self.finalize(record, &verified)?;
        Ok(true)
    }

    /// A dataset is complete only when every chunk is stored and the
    /// derived hash of the ordered chunk hashes equals the catalog's
    /// content hash; otherwise every blob is quarantined.
    fn finalize(&self, record: &DatasetRecord, verified: &RoaringBitmap) -> Result<(), P2pError> {
        let hashes = record.chunk_hashes();
        for (index, hash) in hashes.iter().enumerate() {
            if !verified.contains(index as u32) || !self.store.chunks.has_chunk(hash)? {
                return Err(P2pError::ChunkIntegrity);
            }
        }
        if content_hash(&hashes) != record.content_hash {
            warn!(
                "Dataset {} failed content verification; quarantining {} chunks.",
                record.dataset_id,
                hashes.len()
            );
            self.store.chunks.quarantine(&hashes)?;
            clear_chunk_bitmap(&self.store, &record.dataset_id)?;
            return Err(P2pError::DatasetIntegrity);
        }
        Ok(())
    }

    fn batch_bytes(&self, record: &DatasetRecord, batch: &[u32]) -> u32 {
        let bytes: u64 = batch
            .iter()
            .filter_map(|index| record.chunks.get(*index as usize))
            .map(|chunk| chunk.size as u64)
            .sum();
        std::cmp::min(std::cmp::min(bytes, self.budget_bytes), u32::MAX as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_prefers_least_loaded() {
        let a = PeerId::random();
        let b = PeerId::random();
        let mut load = AHashMap::new();
        load.insert(a, 2);
        load.insert(b, 0);

        let (peer, batch) = next_assignment(&[3, 5, 9], &load, &[a, b], 4, 2).unwrap();
        assert_eq!(peer, b);
        assert_eq!(batch, vec![3, 5]);
    }

    #[test]
    fn assignment_respects_fan_out() {
        let a = PeerId::random();
        let mut load = AHashMap::new();
        load.insert(a, 4);

        assert!(next_assignment(&[1], &load, &[a], 4, 8).is_none());
        assert!(next_assignment(&[], &load, &[a], 8, 8).is_none());
    }

    mod bitmap {
        use super::*;
        use store::config::env_settings::EnvSettings;
        use store_sqlite::SqliteStore;

        fn open_store() -> (tempfile::TempDir, BibStore<SqliteStore>) {
            let dir = tempfile::tempdir().unwrap();
            let mut settings = EnvSettings::empty();
            settings.set_value(
                "db-path".to_string(),
                dir.path().to_str().unwrap().to_string(),
            );
            let db = SqliteStore::open(&settings).unwrap();
            (dir, BibStore::new(db, &settings).unwrap())
        }

        #[test]
        fn bitmap_survives_reload() {
            let (_dir, store) = open_store();
            let dataset_id = Uuid::new_v4();

            let mut bitmap = RoaringBitmap::new();
            bitmap.insert(0);
            bitmap.insert(3);
            bitmap.insert(9);
            persist_chunk_bitmap(&store, &dataset_id, &bitmap).unwrap();

            let reloaded = load_chunk_bitmap(&store, &dataset_id).unwrap();
            assert_eq!(reloaded, bitmap);

            clear_chunk_bitmap(&store, &dataset_id).unwrap();
            assert!(load_chunk_bitmap(&store, &dataset_id).unwrap().is_empty());
        }
    }
}
