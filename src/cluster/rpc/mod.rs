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

pub mod command;
pub mod listener;
pub mod peer;
pub mod serialize;

use self::command::{Command, CommandResponse};

use super::log::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
};
use super::NodeId;
use store::log::raft::{RaftId, TermId};
use store::rand::RngCore;
use tokio::sync::oneshot;

pub const NONCE_LEN: usize = 16;
pub const PROOF_LEN: usize = 32;

pub type Nonce = [u8; NONCE_LEN];
pub type Proof = [u8; PROOF_LEN];

/// Consensus RPCs plus the connection handshake. `Hello`/`Credentials`
/// only ever appear before a connection is bound to a node id; everything
/// else is refused until the handshake completes.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum Request {
    Hello {
        node_id: NodeId,
        nonce: Nonce,
    },
    Credentials {
        proof: Proof,
    },
    Vote {
        term: TermId,
        last: RaftId,
    },
    AppendEntries {
        term: TermId,
        request: AppendEntriesRequest,
    },
    InstallSnapshot {
        term: TermId,
        request: InstallSnapshotRequest,
    },
    Command {
        command: Command,
    },
    Ping,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum Response {
    Welcome {
        node_id: NodeId,
        nonce: Nonce,
        proof: Proof,
    },
    Ready,
    Vote {
        term: TermId,
        vote_granted: bool,
    },
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
    Command {
        response: CommandResponse,
    },
    StepDown {
        term: TermId,
    },
    Pong,
    UnregisteredPeer,
    /// The request could not be served or delivered; callers retry after
    /// redirect or backoff.
    Unavailable,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

/// Work queued on a peer connection actor. `Notify` responses travel back
/// through the main event channel; `Call` responses complete the oneshot.
pub enum RpcEvent {
    Notify {
        request: Request,
    },
    Call {
        request: Request,
        response_tx: oneshot::Sender<Response>,
    },
}

impl RpcEvent {
    /// Answers the caller when the request never reached the peer.
    pub fn undeliverable(self) {
        if let RpcEvent::Call { response_tx, .. } = self {
            response_tx.send(Response::Unavailable).ok();
        }
    }
}

/// Both directions of a connection prove possession of the cluster key: a
/// proof is a keyed hash over the verifier's nonce and the prover's node
/// id, so a transcript can neither be replayed nor re-attributed.
#[derive(Clone)]
pub struct AuthKey {
    key: [u8; 32],
}

impl AuthKey {
    pub fn new(secret: &str) -> Self {
        AuthKey {
            key: store::blake3::derive_key("bib cluster transport v1", secret.as_bytes()),
        }
    }

    pub fn prove(&self, nonce: &Nonce, node_id: NodeId) -> Proof {
        let mut message = [0u8; NONCE_LEN + 8];
        message[..NONCE_LEN].copy_from_slice(nonce);
        message[NONCE_LEN..].copy_from_slice(&node_id.to_be_bytes());
        *store::blake3::keyed_hash(&self.key, &message).as_bytes()
    }

    pub fn verify(&self, nonce: &Nonce, node_id: NodeId, proof: &Proof) -> bool {
        // blake3::Hash comparison is constant-time.
        store::blake3::Hash::from(self.prove(nonce, node_id)) == store::blake3::Hash::from(*proof)
    }
}

pub fn random_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    store::rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proofs_bind_nonce_and_node_id() {
        let auth = AuthKey::new("a shared secret");
        let nonce = random_nonce();
        let proof = auth.prove(&nonce, 7);

        assert!(auth.verify(&nonce, 7, &proof));
        // A proof for one node id does not authenticate another.
        assert!(!auth.verify(&nonce, 8, &proof));
        // Nor does it survive a different nonce.
        assert!(!auth.verify(&random_nonce(), 7, &proof));
        // Nor a different cluster key.
        assert!(!AuthKey::new("another secret").verify(&nonce, 7, &proof));
    }
}
