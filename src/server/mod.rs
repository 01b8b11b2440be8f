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

pub mod init;

use store::tracing::error;

use crate::BibServer;
use store::{Store, StoreError};

pub trait UnwrapFailure<T> {
    fn failed_to(self, action: &str) -> T;
}

impl<T> UnwrapFailure<T> for Option<T> {
    fn failed_to(self, message: &str) -> T {
        match self {
            Some(result) => result,
            None => {
                error!("Failed to {}", message);
                std::process::exit(1);
            }
        }
    }
}

impl<T, E: std::fmt::Display> UnwrapFailure<T> for Result<T, E> {
    fn failed_to(self, message: &str) -> T {
        match self {
            Ok(result) => result,
            Err(err) => {
                error!("Failed to {}: {}", message, err);
                std::process::exit(1);
            }
        }
    }
}

impl<T> BibServer<T>
where
    T: for<'x> Store<'x> + 'static,
{
    /// Runs blocking store work on the dedicated pool so the async runtime
    /// never stalls on disk I/O.
    pub async fn spawn_worker<U, V>(&self, f: U) -> store::Result<V>
    where
        U: FnOnce() -> store::Result<V> + Send + 'static,
        V: Sync + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();

        self.worker_pool.spawn(move || {
            tx.send(f()).ok();
        });

        rx.await
            .map_err(|e| StoreError::InternalError(format!("Worker thread failed: {}", e)))?
    }

    pub async fn shutdown(&self) {
        self.shutdown_tx.send(true).ok();
        if let Some(p2p) = &self.p2p {
            p2p.shutdown().await;
        }
        if let Some(cluster) = &self.cluster {
            cluster.tx.send(crate::cluster::Event::Shutdown).await.ok();
        }
    }
}
