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

pub mod key;
pub mod leb128;

pub trait StoreSerialize: Sized {
    fn serialize(&self) -> Option<Vec<u8>>;
}

pub trait StoreDeserialize: Sized {
    fn deserialize(bytes: &[u8]) -> Option<Self>;
}

impl StoreSerialize for u64 {
    fn serialize(&self) -> Option<Vec<u8>> {
        self.to_be_bytes().to_vec().into()
    }
}

impl StoreDeserialize for u64 {
    fn deserialize(bytes: &[u8]) -> Option<Self> {
        u64::from_be_bytes(bytes.try_into().ok()?).into()
    }
}

impl StoreSerialize for u32 {
    fn serialize(&self) -> Option<Vec<u8>> {
        self.to_be_bytes().to_vec().into()
    }
}

impl StoreDeserialize for u32 {
    fn deserialize(bytes: &[u8]) -> Option<Self> {
        u32::from_be_bytes(bytes.try_into().ok()?).into()
    }
}

impl StoreSerialize for String {
    fn serialize(&self) -> Option<Vec<u8>> {
        self.as_bytes().to_vec().into()
    }
}

impl StoreDeserialize for String {
    fn deserialize(bytes: &[u8]) -> Option<Self> {
        String::from_utf8(bytes.to_vec()).ok()
    }
}

impl StoreSerialize for Vec<u8> {
    fn serialize(&self) -> Option<Vec<u8>> {
        self.clone().into()
    }
}

impl StoreDeserialize for Vec<u8> {
    fn deserialize(bytes: &[u8]) -> Option<Self> {
        bytes.to_vec().into()
    }
}

impl StoreSerialize for roaring::RoaringBitmap {
    fn serialize(&self) -> Option<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.serialized_size());
        self.serialize_into(&mut bytes).ok()?;
        bytes.into()
    }
}

impl StoreDeserialize for roaring::RoaringBitmap {
    fn deserialize(bytes: &[u8]) -> Option<Self> {
        roaring::RoaringBitmap::deserialize_from(bytes).ok()
    }
}
