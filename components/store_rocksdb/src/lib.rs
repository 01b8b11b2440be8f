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

use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use store::{
    config::env_settings::EnvSettings,
    serialize::StoreDeserialize,
    tracing::error,
    Direction, Result, Store, StoreError, Table, WriteOperation,
};

/// Embedded key-value backend. Every logical table maps to a column family.
/// This backend is a cache, never a source of truth: it may not be offered
/// to peers as authoritative and restricts the replication modes a node can
/// assume.
pub struct RocksDB {
    db: DB,
}

pub struct RocksIterator<'x> {
    inner: rocksdb::DBIteratorWithThreadMode<'x, DB>,
}

impl<'x> Iterator for RocksIterator<'x> {
    type Item = (Box<[u8]>, Box<[u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(item) => Some(item),
            Err(e) => {
                error!("RocksDB iterator failure: {}", e);
                None
            }
        }
    }
}

impl RocksDB {
    fn cf(&self, table: Table) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(table.name()).ok_or_else(|| {
            StoreError::InternalError(format!("No '{}' column family found.", table.name()))
        })
    }
}

impl<'x> Store<'x> for RocksDB {
    type Iterator = RocksIterator<'x>;

    fn open(settings: &EnvSettings) -> Result<Self> {
        let path = format!(
            "{}/db",
            settings
                .get("db-path")
                .unwrap_or_else(|| "bib-data".to_string())
        );

        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        Ok(Self {
            db: DB::open_cf_descriptors(
                &db_opts,
                path,
                Table::ALL
                    .iter()
                    .map(|table| ColumnFamilyDescriptor::new(table.name(), Options::default()))
                    .collect::<Vec<_>>(),
            )
            .map_err(|e| StoreError::InternalError(e.into_string()))?,
        })
    }

    fn delete(&self, table: Table, key: &[u8]) -> Result<()> {
        self.db
            .delete_cf(self.cf(table)?, key)
            .map_err(|e| StoreError::InternalError(e.into_string()))
    }

    fn set(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .put_cf(self.cf(table)?, key, value)
            .map_err(|e| StoreError::InternalError(e.into_string()))
    }

    fn get<U>(&self, table: Table, key: &[u8]) -> Result<Option<U>>
    where
        U: StoreDeserialize,
    {
        if let Some(bytes) = self
            .db
            .get_cf(self.cf(table)?, key)
            .map_err(|e| StoreError::InternalError(e.into_string()))?
        {
            Ok(Some(U::deserialize(&bytes).ok_or_else(|| {
                StoreError::DeserializeError(format!("Failed to deserialize key {:?}.", key))
            })?))
        } else {
            Ok(None)
        }
    }

    fn exists(&self, table: Table, key: &[u8]) -> Result<bool> {
        Ok(self
            .db
            .get_cf(self.cf(table)?, key)
            .map_err(|e| StoreError::InternalError(e.into_string()))?
            .is_some())
    }

    fn write(&self, batch: Vec<WriteOperation>) -> Result<()> {
        let mut write_batch = WriteBatch::default();
        for op in batch {
            match op {
                WriteOperation::Set { table, key, value } => {
                    write_batch.put_cf(self.cf(table)?, key, value);
                }
                WriteOperation::Delete { table, key } => {
                    write_batch.delete_cf(self.cf(table)?, key);
                }
            }
        }
        self.db
            .write(write_batch)
            .map_err(|e| StoreError::InternalError(e.into_string()))
    }

    fn iterator<'y: 'x>(
        &'y self,
        table: Table,
        start: &[u8],
        direction: Direction,
    ) -> Result<Self::Iterator> {
        Ok(RocksIterator {
            inner: self.db.iterator_cf(
                self.cf(table)?,
                rocksdb::IteratorMode::From(
                    start,
                    match direction {
                        Direction::Forward => rocksdb::Direction::Forward,
                        Direction::Backward => rocksdb::Direction::Reverse,
                    },
                ),
            ),
        })
    }

    fn is_authoritative(&self) -> bool {
        false
    }

    fn compact(&self, table: Table) -> Result<()> {
        self.db
            .compact_range_cf(self.cf(table)?, None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| StoreError::InternalError(e.into_string()))
    }
}
