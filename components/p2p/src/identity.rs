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

use std::fs;
use std::path::PathBuf;

use aes_gcm_siv::aead::{Aead, KeyInit};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use store::rand::RngCore;

use crate::error::P2pError;

const KEY_FILE: &str = "identity.key";
const KEY_CONTEXT: &str = "bib identity key v1";
const NONCE_LEN: usize = 12;

/// Long-lived node identity. The Ed25519 signing key is created on first
/// start and persisted encrypted with a key derived from operator-supplied
/// material; the peer id is the multihash of the public key, so any holder
/// of an address can verify a handshake.
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl NodeIdentity {
    pub fn load_or_create(base_path: PathBuf, secret: &str) -> Result<Self, P2pError> {
        let path = base_path.join(KEY_FILE);
        let cipher = Aes256GcmSiv::new(
            store::blake3::derive_key(KEY_CONTEXT, secret.as_bytes())
                .as_slice()
                .into(),
        );

        let keypair = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.len() <= NONCE_LEN {
                return Err(P2pError::Identity(
                    "Identity key file is truncated.".to_string(),
                ));
            }
            let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
            let decrypted = cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| {
                    P2pError::Identity(
                        "Failed to decrypt identity key (wrong secret?).".to_string(),
                    )
                })?;
            Keypair::from_protobuf_encoding(&decrypted)
                .map_err(|e| P2pError::Identity(format!("Corrupted identity key: {}", e)))?
        } else {
            let keypair = Keypair::generate_ed25519();
            let encoded = keypair
                .to_protobuf_encoding()
                .map_err(|e| P2pError::Identity(format!("Failed to encode keypair: {}", e)))?;

            let mut nonce = [0u8; NONCE_LEN];
            store::rand::thread_rng().fill_bytes(&mut nonce);
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&nonce), encoded.as_slice())
                .map_err(|_| P2pError::Identity("Failed to encrypt identity key.".to_string()))?;

            fs::create_dir_all(&base_path)?;
            let mut bytes = Vec::with_capacity(NONCE_LEN + ciphertext.len());
            bytes.extend_from_slice(&nonce);
            bytes.extend_from_slice(&ciphertext);
            fs::write(&path, bytes)?;
            keypair
        };

        let peer_id = PeerId::from(keypair.public());
        Ok(NodeIdentity { keypair, peer_id })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, P2pError> {
        self.keypair
            .sign(msg)
            .map_err(|e| P2pError::Identity(format!("Signing failed: {}", e)))
    }

    /// Verifies a signature against an encoded public key and checks that
    /// the key actually hashes to the claimed peer id.
    pub fn verify(peer_id: &PeerId, public_key: &[u8], msg: &[u8], signature: &[u8]) -> bool {
        match PublicKey::try_decode_protobuf(public_key) {
            Ok(key) => key.to_peer_id() == *peer_id && key.verify(msg, signature),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_persists_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let first =
            NodeIdentity::load_or_create(dir.path().to_path_buf(), "orchid umbrella").unwrap();
        let second =
            NodeIdentity::load_or_create(dir.path().to_path_buf(), "orchid umbrella").unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        NodeIdentity::load_or_create(dir.path().to_path_buf(), "correct").unwrap();
        assert!(NodeIdentity::load_or_create(dir.path().to_path_buf(), "incorrect").is_err());
    }

    #[test]
    fn signatures_verify_and_bind_to_peer_id() {
        let dir = tempfile::tempdir().unwrap();
        let identity = NodeIdentity::load_or_create(dir.path().to_path_buf(), "s").unwrap();

        let msg = b"announce: dataset 42";
        let signature = identity.sign(msg).unwrap();
        let public_key = identity.public_key().encode_protobuf();

        assert!(NodeIdentity::verify(
            &identity.peer_id(),
            &public_key,
            msg,
            &signature
        ));
        assert!(!NodeIdentity::verify(
            &identity.peer_id(),
            &public_key,
            b"tampered",
            &signature
        ));
        assert!(!NodeIdentity::verify(
            &PeerId::random(),
            &public_key,
            msg,
            &signature
        ));
    }
}
