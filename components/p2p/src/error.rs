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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("failed to dial peer: {0}")]
    Dial(String),

    #[error("request to {peer} failed: {reason}")]
    Request { peer: String, reason: String },

    #[error("peer refused the request (busy)")]
    Busy,

    #[error("request timed out")]
    Timeout,

    #[error("no providers found for the requested content")]
    NoProviders,

    #[error("chunk failed integrity verification")]
    ChunkIntegrity,

    #[error("dataset content hash mismatch, blobs quarantined")]
    DatasetIntegrity,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("node event loop is gone")]
    ChannelClosed,

    #[error("identity failure: {0}")]
    Identity(String),

    #[error(transparent)]
    Store(#[from] store::StoreError),
}

impl P2pError {
    /// Transient errors are retried with backoff; the rest surface to the
    /// supervisor.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            P2pError::Io(_)
                | P2pError::Transport(_)
                | P2pError::Dial(_)
                | P2pError::Request { .. }
                | P2pError::Busy
                | P2pError::Timeout
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for P2pError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        P2pError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for P2pError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        P2pError::ChannelClosed
    }
}
