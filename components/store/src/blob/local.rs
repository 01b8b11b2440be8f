use std::{
    fs::{self, File},
    io::{Read, Write},
    path::PathBuf,
};

use crate::{mutex_map::MutexMap, StoreError};

use super::{ChunkHash, ChunkStore};

/// Chunk blobs live under `<base>/blobs/<hash[0:2]>/<hash[2:4]>/<hash>`;
/// rejected datasets are moved aside under `<base>/blobs/quarantine/`.
pub struct LocalChunkStore {
    pub base_path: PathBuf,
    pub quarantine_path: PathBuf,
    in_flight: MutexMap<()>,
}

impl LocalChunkStore {
    pub fn open(mut base_path: PathBuf) -> crate::Result<Self> {
        base_path.push("blobs");
        let quarantine_path = base_path.join("quarantine");
        fs::create_dir_all(&quarantine_path)?;
        Ok(LocalChunkStore {
            base_path,
            quarantine_path,
            in_flight: MutexMap::with_capacity(1024),
        })
    }

    fn chunk_path(&self, hash: &ChunkHash) -> PathBuf {
        let hex = hash.to_string();
        let mut path = self.base_path.clone();
        path.push(&hex[0..2]);
        path.push(&hex[2..4]);
        path.push(hex);
        path
    }

    /// Moves every blob of a rejected dataset into quarantine so an operator
    /// can inspect it; the chunks stop being served immediately.
    pub fn quarantine(&self, hashes: &[ChunkHash]) -> crate::Result<usize> {
        let mut moved = 0;
        for hash in hashes {
            let path = self.chunk_path(hash);
            if path.exists() {
                fs::rename(&path, self.quarantine_path.join(hash.to_string()))?;
                moved += 1;
            }
        }
        Ok(moved)
    }
}

impl ChunkStore for LocalChunkStore {
    fn put_chunk(&self, hash: &ChunkHash, bytes: &[u8]) -> crate::Result<bool> {
        if &ChunkHash::of(bytes) != hash {
            return Err(StoreError::IntegrityFailure(format!(
                "Chunk bytes do not match claimed hash {}.",
                hash
            )));
        }

        // Serialize concurrent writers for the same hash; whoever loses the
        // race finds the blob already materialized.
        let _guard = self.in_flight.lock_hash(hash);

        let path = self.chunk_path(hash);
        if path.exists() {
            return Ok(false);
        }

        fs::create_dir_all(path.parent().unwrap())?;
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.flush()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(true)
    }

    fn get_chunk(&self, hash: &ChunkHash) -> crate::Result<Option<Vec<u8>>> {
        let path = self.chunk_path(hash);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(Some(bytes))
    }

    fn has_chunk(&self, hash: &ChunkHash) -> crate::Result<bool> {
        Ok(self.chunk_path(hash).exists())
    }

    fn delete_chunk(&self, hash: &ChunkHash) -> crate::Result<bool> {
        let path = self.chunk_path(hash);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn iter_chunks(&self) -> crate::Result<Vec<ChunkHash>> {
        let mut hashes = Vec::new();
        for level1 in fs::read_dir(&self.base_path)? {
            let level1 = level1?.path();
            if !level1.is_dir() || level1 == self.quarantine_path {
                continue;
            }
            for level2 in fs::read_dir(&level1)? {
                let level2 = level2?.path();
                if !level2.is_dir() {
                    continue;
                }
                for blob in fs::read_dir(&level2)? {
                    if let Some(hash) = blob?
                        .file_name()
                        .to_str()
                        .and_then(ChunkHash::from_hex)
                    {
                        hashes.push(hash);
                    }
                }
            }
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_verifies_and_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::open(dir.path().to_path_buf()).unwrap();

        let bytes = b"research data chunk".to_vec();
        let hash = ChunkHash::of(&bytes);

        assert!(store.put_chunk(&hash, &bytes).unwrap());
        assert!(!store.put_chunk(&hash, &bytes).unwrap());
        assert_eq!(store.get_chunk(&hash).unwrap().unwrap(), bytes);

        // A put with bytes that do not hash to the claimed address fails.
        assert!(matches!(
            store.put_chunk(&hash, b"tampered"),
            Err(StoreError::IntegrityFailure(_))
        ));
    }

    #[test]
    fn quarantine_removes_from_service() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::open(dir.path().to_path_buf()).unwrap();

        let bytes = b"bad dataset chunk".to_vec();
        let hash = ChunkHash::of(&bytes);
        store.put_chunk(&hash, &bytes).unwrap();

        assert_eq!(store.quarantine(&[hash]).unwrap(), 1);
        assert!(!store.has_chunk(&hash).unwrap());
        assert!(store.iter_chunks().unwrap().is_empty());
    }
}
