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

use uuid::Uuid;

use crate::log::raft::LogIndex;

pub struct LogKey {}

impl LogKey {
    pub const ENTRY_KEY_PREFIX: u8 = 0;
    pub const ENTRY_KEY_LEN: usize = std::mem::size_of::<LogIndex>() + 1;

    pub fn serialize_entry(index: LogIndex) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(LogKey::ENTRY_KEY_LEN);
        bytes.push(LogKey::ENTRY_KEY_PREFIX);
        bytes.extend_from_slice(&index.to_be_bytes());
        bytes
    }

    pub fn deserialize_entry(bytes: &[u8]) -> Option<LogIndex> {
        if bytes.len() == LogKey::ENTRY_KEY_LEN && bytes[0] == LogKey::ENTRY_KEY_PREFIX {
            LogIndex::from_be_bytes(bytes[1..].try_into().ok()?).into()
        } else {
            None
        }
    }
}

pub struct SystemKey {}

impl SystemKey {
    pub const HARD_STATE: &'static [u8] = b"hard_state";
    pub const APPLIED_INDEX: &'static [u8] = b"applied_index";
    pub const SNAPSHOT_LIST: &'static [u8] = b"snapshots";
    pub const SUBSCRIPTIONS: &'static [u8] = b"subscriptions";
    pub const PEER_LIST: &'static [u8] = b"peer_list";
    pub const NODE_ID: &'static [u8] = b"node_id";

    const BITMAP_KEY_PREFIX: &'static [u8] = b"bitmap.";

    pub fn serialize_chunk_bitmap(dataset_id: &Uuid) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(SystemKey::BITMAP_KEY_PREFIX.len() + std::mem::size_of::<Uuid>());
        bytes.extend_from_slice(SystemKey::BITMAP_KEY_PREFIX);
        bytes.extend_from_slice(dataset_id.as_bytes());
        bytes
    }
}

pub struct CatalogKey {}

impl CatalogKey {
    pub const TOPIC_KEY_PREFIX: u8 = 0;
    pub const DATASET_KEY_PREFIX: u8 = 1;

    pub fn serialize_topic(topic_id: &Uuid) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + std::mem::size_of::<Uuid>());
        bytes.push(CatalogKey::TOPIC_KEY_PREFIX);
        bytes.extend_from_slice(topic_id.as_bytes());
        bytes
    }

    pub fn serialize_dataset(topic_id: &Uuid, dataset_id: &Uuid) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + 2 * std::mem::size_of::<Uuid>());
        bytes.push(CatalogKey::DATASET_KEY_PREFIX);
        bytes.extend_from_slice(topic_id.as_bytes());
        bytes.extend_from_slice(dataset_id.as_bytes());
        bytes
    }

    pub fn deserialize_dataset(bytes: &[u8]) -> Option<(Uuid, Uuid)> {
        if bytes.len() == 1 + 32 && bytes[0] == CatalogKey::DATASET_KEY_PREFIX {
            Some((
                Uuid::from_slice(&bytes[1..17]).ok()?,
                Uuid::from_slice(&bytes[17..33]).ok()?,
            ))
        } else {
            None
        }
    }
}
