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

pub mod log;

use store::config::env_settings::EnvSettings;
use store::BibStore;
use store_rocksdb::RocksDB;
use store_sqlite::SqliteStore;
use tempfile::TempDir;

pub fn init_settings(dir: &TempDir) -> EnvSettings {
    let mut settings = EnvSettings::empty();
    settings.set_value(
        "db-path".to_string(),
        dir.path().to_str().unwrap().to_string(),
    );
    settings.set_value("cluster-key".to_string(), "a sealed envelope".to_string());
    settings
}

pub fn open_rocksdb_store() -> (TempDir, BibStore<RocksDB>) {
    use store::Store;

    let dir = tempfile::tempdir().unwrap();
    let settings = init_settings(&dir);
    let db = RocksDB::open(&settings).unwrap();
    (dir, BibStore::new(db, &settings).unwrap())
}

pub fn open_sqlite_store() -> (TempDir, BibStore<SqliteStore>) {
    use store::Store;

    let dir = tempfile::tempdir().unwrap();
    let settings = init_settings(&dir);
    let db = SqliteStore::open(&settings).unwrap();
    (dir, BibStore::new(db, &settings).unwrap())
}
