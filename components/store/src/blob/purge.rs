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

use ahash::AHashSet;
use tracing::debug;

use super::{local::LocalChunkStore, ChunkHash, ChunkStore};

impl LocalChunkStore {
    /// Returns the on-disk chunks that no catalog entry references.
    pub fn iter_orphans(&self, live: &AHashSet<ChunkHash>) -> crate::Result<Vec<ChunkHash>> {
        Ok(self
            .iter_chunks()?
            .into_iter()
            .filter(|hash| !live.contains(hash))
            .collect())
    }

    /// Deletes orphaned chunks, returning how many were removed.
    pub fn purge_orphans(&self, live: &AHashSet<ChunkHash>) -> crate::Result<usize> {
        let orphans = self.iter_orphans(live)?;
        let mut deleted = 0;
        for hash in &orphans {
            if self.delete_chunk(hash)? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            debug!("Purged {} orphaned chunk blobs.", deleted);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_spares_live_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::open(dir.path().to_path_buf()).unwrap();

        let live_bytes = b"still referenced".to_vec();
        let orphan_bytes = b"no longer referenced".to_vec();
        let live_hash = ChunkHash::of(&live_bytes);
        let orphan_hash = ChunkHash::of(&orphan_bytes);
        store.put_chunk(&live_hash, &live_bytes).unwrap();
        store.put_chunk(&orphan_hash, &orphan_bytes).unwrap();

        let mut live = AHashSet::new();
        live.insert(live_hash);

        assert_eq!(store.iter_orphans(&live).unwrap(), vec![orphan_hash]);
        assert_eq!(store.purge_orphans(&live).unwrap(), 1);
        assert!(store.has_chunk(&live_hash).unwrap());
        assert!(!store.has_chunk(&orphan_hash).unwrap());
    }
}
