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

pub mod local;
pub mod purge;

use std::fmt::Display;

pub const CHUNK_HASH_LEN: usize = 32;

/// Content address of a chunk: the blake3 digest of its bytes.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ChunkHash(pub [u8; CHUNK_HASH_LEN]);

impl ChunkHash {
    pub fn of(bytes: &[u8]) -> Self {
        ChunkHash(*blake3::hash(bytes).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; CHUNK_HASH_LEN] {
        &self.0
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != CHUNK_HASH_LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; CHUNK_HASH_LEN];
        for (pos, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(pos * 2..pos * 2 + 2)?, 16).ok()?;
        }
        Some(ChunkHash(bytes))
    }
}

impl Display for ChunkHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<[u8; CHUNK_HASH_LEN]> for ChunkHash {
    fn from(bytes: [u8; CHUNK_HASH_LEN]) -> Self {
        ChunkHash(bytes)
    }
}

/// The identity of a dataset is the digest of its ordered chunk digests;
/// re-downloading chunks can never change it.
pub fn content_hash(chunk_hashes: &[ChunkHash]) -> ChunkHash {
    let mut hasher = blake3::Hasher::new();
    for chunk_hash in chunk_hashes {
        hasher.update(chunk_hash.as_bytes());
    }
    ChunkHash(*hasher.finalize().as_bytes())
}

/// Content-addressed chunk storage. A put whose bytes do not match the
/// claimed hash fails; a put for an existing hash is a no-op.
pub trait ChunkStore: Sized + Send + Sync {
    fn put_chunk(&self, hash: &ChunkHash, bytes: &[u8]) -> crate::Result<bool>;
    fn get_chunk(&self, hash: &ChunkHash) -> crate::Result<Option<Vec<u8>>>;
    fn has_chunk(&self, hash: &ChunkHash) -> crate::Result<bool>;
    fn delete_chunk(&self, hash: &ChunkHash) -> crate::Result<bool>;
    fn iter_chunks(&self) -> crate::Result<Vec<ChunkHash>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_order_sensitive() {
        let a = ChunkHash::of(b"chunk a");
        let b = ChunkHash::of(b"chunk b");
        assert_ne!(content_hash(&[a, b]), content_hash(&[b, a]));
        assert_eq!(content_hash(&[a, b]), content_hash(&[a, b]));
    }

    #[test]
    fn hex_round_trip() {
        let hash = ChunkHash::of(b"some chunk");
        assert_eq!(ChunkHash::from_hex(&hash.to_string()), Some(hash));
        assert_eq!(ChunkHash::from_hex("zz"), None);
    }
}
