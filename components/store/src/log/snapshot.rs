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

use std::{
    fs::{self, File},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
};

use crate::StoreError;

use super::raft::RaftId;

pub const DEFAULT_RETAIN_COUNT: usize = 3;

/// On-disk format: `[u32 BE meta length][bincode SnapshotMeta][payload]`.
/// File names are `<last_included.index>-<last_included.term>.snap`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMeta {
    pub last_included: RaftId,
    pub configuration: Vec<u8>,
    pub size: u64,
    pub created_at: i64,
}

pub struct SnapshotStore {
    pub base_path: PathBuf,
    pub retain_count: usize,
}

impl SnapshotStore {
    pub fn open(mut base_path: PathBuf, retain_count: usize) -> crate::Result<Self> {
        base_path.push("snapshots");
        fs::create_dir_all(&base_path)?;
        Ok(SnapshotStore {
            base_path,
            retain_count: retain_count.max(1),
        })
    }

    fn snapshot_path(&self, last_included: &RaftId) -> PathBuf {
        self.base_path.join(format!(
            "{:020}-{:020}.snap",
            last_included.index, last_included.term
        ))
    }

    /// Persists a snapshot atomically (write to a temporary name, then
    /// rename) and prunes everything but the most recent `retain_count`.
    pub fn write(
        &self,
        last_included: RaftId,
        configuration: Vec<u8>,
        payload: &[u8],
    ) -> crate::Result<SnapshotMeta> {
        let meta = SnapshotMeta {
            last_included,
            configuration,
            size: payload.len() as u64,
            created_at: chrono::Utc::now().timestamp(),
        };

        let meta_bytes = bincode::serialize(&meta).map_err(|e| {
            StoreError::SerializeError(format!("Failed to serialize snapshot meta: {}", e))
        })?;

        let path = self.snapshot_path(&last_included);
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&(meta_bytes.len() as u32).to_be_bytes())?;
            file.write_all(&meta_bytes)?;
            file.write_all(payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        self.prune()?;
        Ok(meta)
    }

    pub fn list(&self) -> crate::Result<Vec<SnapshotMeta>> {
        let mut snapshots = Vec::new();
        for dir_entry in fs::read_dir(&self.base_path)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("snap") {
                snapshots.push(self.read_meta(&path)?);
            }
        }
        snapshots.sort_by_key(|meta| meta.last_included.index);
        Ok(snapshots)
    }

    pub fn latest(&self) -> crate::Result<Option<SnapshotMeta>> {
        Ok(self.list()?.pop())
    }

    pub fn read_payload(&self, meta: &SnapshotMeta) -> crate::Result<Vec<u8>> {
        let mut file = File::open(self.snapshot_path(&meta.last_included))?;
        let payload_start = self.payload_offset(&mut file)?;
        file.seek(SeekFrom::Start(payload_start))?;
        let mut payload = Vec::with_capacity(meta.size as usize);
        file.read_to_end(&mut payload)?;
        Ok(payload)
    }

    /// Reads `len` bytes of the payload starting at `offset`, clamped to the
    /// payload size. Used to stream snapshots to lagging followers.
    pub fn read_segment(
        &self,
        meta: &SnapshotMeta,
        offset: u64,
        len: usize,
    ) -> crate::Result<Vec<u8>> {
        if offset >= meta.size {
            return Ok(Vec::new());
        }
        let mut file = File::open(self.snapshot_path(&meta.last_included))?;
        let payload_start = self.payload_offset(&mut file)?;
        file.seek(SeekFrom::Start(payload_start + offset))?;
        let mut segment = vec![0; std::cmp::min(len as u64, meta.size - offset) as usize];
        file.read_exact(&mut segment)?;
        Ok(segment)
    }

    pub fn delete(&self, meta: &SnapshotMeta) -> crate::Result<bool> {
        let path = self.snapshot_path(&meta.last_included);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn prune(&self) -> crate::Result<()> {
        let snapshots = self.list()?;
        if snapshots.len() > self.retain_count {
            for meta in &snapshots[..snapshots.len() - self.retain_count] {
                self.delete(meta)?;
            }
        }
        Ok(())
    }

    fn read_meta(&self, path: &PathBuf) -> crate::Result<SnapshotMeta> {
        let mut file = File::open(path)?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let mut meta_bytes = vec![0; u32::from_be_bytes(len_bytes) as usize];
        file.read_exact(&mut meta_bytes)?;
        bincode::deserialize(&meta_bytes).map_err(|e| {
            StoreError::DataCorruption(format!(
                "Corrupted snapshot meta in {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn payload_offset(&self, file: &mut File) -> crate::Result<u64> {
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        Ok(4 + u32::from_be_bytes(len_bytes) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().to_path_buf(), 3).unwrap();

        for index in 1..=5u64 {
            store
                .write(RaftId::new(1, index), Vec::new(), b"payload")
                .unwrap();
        }

        let snapshots = store.list().unwrap();
        assert_eq!(
            snapshots
                .iter()
                .map(|meta| meta.last_included.index)
                .collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
    }

    #[test]
    fn snapshot_payload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().to_path_buf(), 3).unwrap();
        let payload = (0..=255u8).cycle().take(10_000).collect::<Vec<_>>();

        let meta = store
            .write(RaftId::new(2, 42), b"config".to_vec(), &payload)
            .unwrap();
        assert_eq!(meta.size, payload.len() as u64);

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest, meta);
        assert_eq!(store.read_payload(&latest).unwrap(), payload);

        // Segmented reads reassemble to the full payload.
        let mut reassembled = Vec::new();
        let mut offset = 0;
        loop {
            let segment = store.read_segment(&latest, offset, 1024).unwrap();
            if segment.is_empty() {
                break;
            }
            offset += segment.len() as u64;
            reassembled.extend_from_slice(&segment);
        }
        assert_eq!(reassembled, payload);
    }
}
