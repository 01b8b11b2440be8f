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

use rusqlite::Connection;
use store::{
    config::env_settings::EnvSettings,
    parking_lot::Mutex,
    serialize::StoreDeserialize,
    Direction, Result, Store, StoreError, Table, WriteOperation,
};

/// Managed relational backend. Each logical table is a two-column SQL table
/// `(k BLOB PRIMARY KEY, v BLOB)`; SQLite compares blobs bytewise, so key
/// iteration order matches the KV backends. This backend is authoritative:
/// its contents may be served to peers as a source of truth.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn sql_err(err: rusqlite::Error) -> StoreError {
    StoreError::InternalError(format!("SQLite failure: {}", err))
}

impl<'x> Store<'x> for SqliteStore {
    type Iterator = std::vec::IntoIter<(Box<[u8]>, Box<[u8]>)>;

    fn open(settings: &EnvSettings) -> Result<Self> {
        let path = format!(
            "{}/catalog.sqlite3",
            settings
                .get("db-path")
                .unwrap_or_else(|| "bib-data".to_string())
        );
        if let Some(parent) = std::path::Path::new(&path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path).map_err(sql_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sql_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(sql_err)?;

        for table in Table::ALL {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (k BLOB PRIMARY KEY, v BLOB NOT NULL) WITHOUT ROWID",
                    table.name()
                ),
                [],
            )
            .map_err(sql_err)?;
        }

        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn delete(&self, table: Table, key: &[u8]) -> Result<()> {
        self.conn
            .lock()
            .execute(
                &format!("DELETE FROM {} WHERE k = ?1", table.name()),
                [key],
            )
            .map(|_| ())
            .map_err(sql_err)
    }

    fn set(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        self.conn
            .lock()
            .execute(
                &format!(
                    "INSERT INTO {} (k, v) VALUES (?1, ?2) ON CONFLICT(k) DO UPDATE SET v = ?2",
                    table.name()
                ),
                [key, value],
            )
            .map(|_| ())
            .map_err(sql_err)
    }

    fn get<U>(&self, table: Table, key: &[u8]) -> Result<Option<U>>
    where
        U: StoreDeserialize,
    {
        let conn = self.conn.lock();
        let mut statement = conn
            .prepare_cached(&format!("SELECT v FROM {} WHERE k = ?1", table.name()))
            .map_err(sql_err)?;
        let mut rows = statement.query([key]).map_err(sql_err)?;

        if let Some(row) = rows.next().map_err(sql_err)? {
            let bytes: Vec<u8> = row.get(0).map_err(sql_err)?;
            Ok(Some(U::deserialize(&bytes).ok_or_else(|| {
                StoreError::DeserializeError(format!("Failed to deserialize key {:?}.", key))
            })?))
        } else {
            Ok(None)
        }
    }

    fn exists(&self, table: Table, key: &[u8]) -> Result<bool> {
        let conn = self.conn.lock();
        let mut statement = conn
            .prepare_cached(&format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE k = ?1)",
                table.name()
            ))
            .map_err(sql_err)?;
        statement
            .query_row([key], |row| row.get::<_, bool>(0))
            .map_err(sql_err)
    }

    fn write(&self, batch: Vec<WriteOperation>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        for op in &batch {
            match op {
                WriteOperation::Set { table, key, value } => {
                    tx.execute(
                        &format!(
                            "INSERT INTO {} (k, v) VALUES (?1, ?2) ON CONFLICT(k) DO UPDATE SET v = ?2",
                            table.name()
                        ),
                        [key.as_slice(), value.as_slice()],
                    )
                    .map_err(sql_err)?;
                }
                WriteOperation::Delete { table, key } => {
                    tx.execute(
                        &format!("DELETE FROM {} WHERE k = ?1", table.name()),
                        [key.as_slice()],
                    )
                    .map_err(sql_err)?;
                }
            }
        }
        tx.commit().map_err(sql_err)
    }

    fn iterator<'y: 'x>(
        &'y self,
        table: Table,
        start: &[u8],
        direction: Direction,
    ) -> Result<Self::Iterator> {
        let conn = self.conn.lock();
        let mut statement = conn
            .prepare_cached(&match direction {
                Direction::Forward => {
                    format!("SELECT k, v FROM {} WHERE k >= ?1 ORDER BY k ASC", table.name())
                }
                Direction::Backward => {
                    format!("SELECT k, v FROM {} WHERE k <= ?1 ORDER BY k DESC", table.name())
                }
            })
            .map_err(sql_err)?;

        let mut rows = statement.query([start]).map_err(sql_err)?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().map_err(sql_err)? {
            let key: Vec<u8> = row.get(0).map_err(sql_err)?;
            let value: Vec<u8> = row.get(1).map_err(sql_err)?;
            items.push((key.into_boxed_slice(), value.into_boxed_slice()));
        }
        Ok(items.into_iter())
    }

    fn is_authoritative(&self) -> bool {
        true
    }

    fn compact(&self, _table: Table) -> Result<()> {
        self.conn
            .lock()
            .execute_batch("PRAGMA incremental_vacuum")
            .map_err(sql_err)
    }

    fn close(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")
            .map_err(sql_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = EnvSettings::empty();
        settings.set_value(
            "db-path".to_string(),
            dir.path().to_str().unwrap().to_string(),
        );
        let store = SqliteStore::open(&settings).unwrap();
        (dir, store)
    }

    #[test]
    fn set_get_delete() {
        let (_dir, store) = open_store();

        store.set(Table::Config, b"greeting", b"hi").unwrap();
        assert_eq!(
            store.get::<Vec<u8>>(Table::Config, b"greeting").unwrap(),
            Some(b"hi".to_vec())
        );
        assert!(store.exists(Table::Config, b"greeting").unwrap());

        store.delete(Table::Config, b"greeting").unwrap();
        assert_eq!(
            store.get::<Vec<u8>>(Table::Config, b"greeting").unwrap(),
            None
        );
    }

    #[test]
    fn iteration_order_is_bytewise() {
        let (_dir, store) = open_store();

        for key in [&b"a"[..], b"ab", b"b", b"ba"] {
            store.set(Table::Catalog, key, key).unwrap();
        }

        let forward = store
            .iterator(Table::Catalog, b"a", Direction::Forward)
            .unwrap()
            .map(|(k, _)| k.to_vec())
            .collect::<Vec<_>>();
        assert_eq!(forward, vec![b"a".to_vec(), b"ab".to_vec(), b"b".to_vec(), b"ba".to_vec()]);

        let backward = store
            .iterator(Table::Catalog, b"b", Direction::Backward)
            .unwrap()
            .map(|(k, _)| k.to_vec())
            .collect::<Vec<_>>();
        assert_eq!(backward, vec![b"b".to_vec(), b"ab".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn batches_are_atomic() {
        let (_dir, store) = open_store();

        store
            .write(vec![
                WriteOperation::set(Table::Jobs, b"job-1".to_vec(), b"pending".to_vec()),
                WriteOperation::set(Table::Jobs, b"job-2".to_vec(), b"pending".to_vec()),
                WriteOperation::delete(Table::Jobs, b"job-1".to_vec()),
            ])
            .unwrap();

        assert!(!store.exists(Table::Jobs, b"job-1").unwrap());
        assert!(store.exists(Table::Jobs, b"job-2").unwrap());
    }
}
