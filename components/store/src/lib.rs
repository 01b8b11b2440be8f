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

pub mod blob;
pub mod config;
pub mod core;
pub mod log;
pub mod mutex_map;
pub mod serialize;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use blob::local::LocalChunkStore;
use config::env_settings::EnvSettings;
use log::raft::RaftId;
use log::snapshot::{SnapshotStore, DEFAULT_RETAIN_COUNT};
use serialize::StoreDeserialize;

pub use self::core::error::StoreError;

pub use ahash;
pub use bincode;
pub use blake3;
pub use chrono;
pub use parking_lot;
pub use rand;
pub use roaring;
pub use tracing;
pub use uuid;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Logical tables of the durable backend. KV backends map these to column
/// families, the relational backend maps them to SQL tables.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Ord, PartialOrd)]
pub enum Table {
    Catalog,
    Jobs,
    Config,
    Membership,
    Logs,
    System,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Catalog,
        Table::Jobs,
        Table::Config,
        Table::Membership,
        Table::Logs,
        Table::System,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Catalog => "catalog",
            Table::Jobs => "jobs",
            Table::Config => "config",
            Table::Membership => "membership",
            Table::Logs => "logs",
            Table::System => "system",
        }
    }
}

pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOperation {
    Set {
        table: Table,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: Vec<u8>,
    },
}

impl WriteOperation {
    pub fn set(table: Table, key: Vec<u8>, value: Vec<u8>) -> Self {
        WriteOperation::Set { table, key, value }
    }

    pub fn delete(table: Table, key: Vec<u8>) -> Self {
        WriteOperation::Delete { table, key }
    }
}

/// Durable backend adapter. `write` applies a batch atomically; iteration is
/// ordered by key, starting at `start` inclusive (forward) or ending at
/// `start` inclusive (backward).
pub trait Store<'x>
where
    Self: Sized + Send + Sync,
{
    type Iterator: Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'x;

    fn open(settings: &EnvSettings) -> Result<Self>;
    fn delete(&self, table: Table, key: &[u8]) -> Result<()>;
    fn set(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()>;
    fn get<U>(&self, table: Table, key: &[u8]) -> Result<Option<U>>
    where
        U: StoreDeserialize;
    fn exists(&self, table: Table, key: &[u8]) -> Result<bool>;
    fn write(&self, batch: Vec<WriteOperation>) -> Result<()>;
    fn iterator<'y: 'x>(
        &'y self,
        table: Table,
        start: &[u8],
        direction: Direction,
    ) -> Result<Self::Iterator>;

    /// Whether this backend's contents may be offered to peers as a source
    /// of truth (provider records, full replicas).
    fn is_authoritative(&self) -> bool;

    fn compact(&self, table: Table) -> Result<()>;
    fn close(&self) -> Result<()>;
}

pub struct BibStore<T> {
    pub db: T,
    pub chunks: LocalChunkStore,
    pub snapshots: SnapshotStore,

    pub raft_term: AtomicU64,
    pub raft_index: AtomicU64,
    pub applied_index: AtomicU64,
}

impl<T> BibStore<T>
where
    T: for<'x> Store<'x> + 'static,
{
    pub fn new(db: T, settings: &EnvSettings) -> Result<Self> {
        let base_path = PathBuf::from(
            settings
                .get("db-path")
                .unwrap_or_else(|| "bib-data".to_string()),
        );

        let store = Self {
            chunks: LocalChunkStore::open(base_path.clone())?,
            snapshots: SnapshotStore::open(
                base_path,
                settings
                    .parse("snapshot-retain-count")
                    .unwrap_or(DEFAULT_RETAIN_COUNT),
            )?,
            raft_term: 0.into(),
            raft_index: 0.into(),
            applied_index: 0.into(),
            db,
        };

        // Recover log and apply positions.
        let last_log = store.get_last_log_id()?.unwrap_or_else(RaftId::none);
        store.raft_term.store(last_log.term, Ordering::Release);
        store.raft_index.store(last_log.index, Ordering::Release);
        store.applied_index.store(
            store
                .db
                .get::<u64>(Table::System, serialize::key::SystemKey::APPLIED_INDEX)?
                .unwrap_or(0),
            Ordering::Release,
        );

        Ok(store)
    }

    pub fn is_authoritative(&self) -> bool {
        self.db.is_authoritative()
    }

    /// Delete operations covering every key of a table, for rebuilding it
    /// from a snapshot in one atomic batch.
    pub fn clear_table_ops(&self, table: Table) -> Result<Vec<WriteOperation>> {
        Ok(self
            .db
            .iterator(table, &[], Direction::Forward)?
            .map(|(key, _)| WriteOperation::delete(table, key.to_vec()))
            .collect())
    }
}
