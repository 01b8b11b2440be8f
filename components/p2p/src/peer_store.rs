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

use std::time::{Duration, Instant};

use libp2p::{Multiaddr, PeerId};
use store::ahash::AHashMap;
use store::parking_lot::RwLock;
use store::tracing::debug;

use crate::types::PeerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    Unknown,
    Trusted,
    Pinned,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
    pub last_seen: Instant,
    pub trust: TrustState,
    pub reputation: i32,
    rejected_until: Option<Instant>,
}

impl PeerEntry {
    fn new(peer_id: PeerId) -> Self {
        PeerEntry {
            peer_id,
            addresses: Vec::new(),
            last_seen: Instant::now(),
            trust: TrustState::Unknown,
            reputation: 0,
            rejected_until: None,
        }
    }
}

/// All discovery sources (bootstrap, mDNS, DHT, gossip) feed this single
/// store. Reputation: +1 on a successful exchange, -2 on authentication
/// failure, -1 on protocol error, decaying toward zero over time. Peers at
/// or below the floor are not dialed; peers at the ceiling are preferred.
pub struct PeerStore {
    peers: RwLock<AHashMap<PeerId, PeerEntry>>,
    floor: i32,
    ceiling: i32,
    idle_ttl: Duration,
    reject_cooldown: Duration,
}

impl PeerStore {
    pub fn new(floor: i32, ceiling: i32, idle_ttl_ms: u64, reject_cooldown_ms: u64) -> Self {
        PeerStore {
            peers: RwLock::new(AHashMap::new()),
            floor,
            ceiling,
            idle_ttl: Duration::from_millis(idle_ttl_ms),
            reject_cooldown: Duration::from_millis(reject_cooldown_ms),
        }
    }

    /// Registers an observation of a peer, merging any newly learned
    /// address to the back of its address list.
    pub fn observe(&self, peer_id: PeerId, address: Option<Multiaddr>) {
        let mut peers = self.peers.write();
        let entry = peers
            .entry(peer_id)
            .or_insert_with(|| PeerEntry::new(peer_id));
        entry.last_seen = Instant::now();
        if let Some(address) = address {
            if !entry.addresses.contains(&address) {
                entry.addresses.push(address);
            }
        }
    }

    pub fn record_success(&self, peer_id: &PeerId) {
        self.adjust(peer_id, 1);
    }

    pub fn record_protocol_error(&self, peer_id: &PeerId) {
        self.adjust(peer_id, -1);
    }

    pub fn record_integrity_failure(&self, peer_id: &PeerId) {
        self.adjust(peer_id, -2);
    }

    pub fn record_auth_failure(&self, peer_id: &PeerId) {
        let mut peers = self.peers.write();
        let entry = peers
            .entry(*peer_id)
            .or_insert_with(|| PeerEntry::new(*peer_id));
        entry.reputation = (entry.reputation - 2).max(self.floor);
        entry.trust = TrustState::Rejected;
        entry.rejected_until = Some(Instant::now() + self.reject_cooldown);
        debug!("Peer {} rejected for authentication failure.", peer_id);
    }

    pub fn pin(&self, peer_id: PeerId) {
        let mut peers = self.peers.write();
        peers
            .entry(peer_id)
            .or_insert_with(|| PeerEntry::new(peer_id))
            .trust = TrustState::Pinned;
    }

    fn adjust(&self, peer_id: &PeerId, delta: i32) {
        let mut peers = self.peers.write();
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.reputation = (entry.reputation + delta).clamp(self.floor, self.ceiling);
            entry.last_seen = Instant::now();
            if delta > 0 && entry.trust == TrustState::Unknown {
                entry.trust = TrustState::Trusted;
            }
        }
    }

    /// A peer may be dialed unless its reputation sits at the floor or it
    /// is inside a rejection cooldown.
    pub fn is_dialable(&self, peer_id: &PeerId) -> bool {
        let peers = self.peers.read();
        match peers.get(peer_id) {
            Some(entry) => {
                if let Some(until) = entry.rejected_until {
                    if Instant::now() < until {
                        return false;
                    }
                }
                entry.reputation > self.floor || entry.trust == TrustState::Pinned
            }
            None => true,
        }
    }

    /// Orders candidate providers best-first: pinned, then by reputation.
    pub fn preferred_order(&self, candidates: &mut Vec<PeerId>) {
        let peers = self.peers.read();
        candidates.retain(|peer_id| match peers.get(peer_id) {
            Some(entry) => {
                entry.trust == TrustState::Pinned || entry.reputation > self.floor
            }
            None => true,
        });
        candidates.sort_by_key(|peer_id| {
            peers
                .get(peer_id)
                .map(|entry| {
                    (
                        entry.trust != TrustState::Pinned,
                        -(entry.reputation as i64),
                    )
                })
                .unwrap_or((true, 0))
        });
    }

    pub fn addresses(&self, peer_id: &PeerId) -> Vec<Multiaddr> {
        self.peers
            .read()
            .get(peer_id)
            .map(|entry| entry.addresses.clone())
            .unwrap_or_default()
    }

    pub fn reputation(&self, peer_id: &PeerId) -> i32 {
        self.peers
            .read()
            .get(peer_id)
            .map(|entry| entry.reputation)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Periodic maintenance: decay reputations toward zero, lift elapsed
    /// rejection cooldowns, evict idle peers that earned no standing.
    pub fn maintain(&self) {
        let now = Instant::now();
        let mut peers = self.peers.write();
        peers.retain(|_, entry| {
            if let Some(until) = entry.rejected_until {
                if now >= until {
                    entry.rejected_until = None;
                    entry.trust = TrustState::Unknown;
                }
            }
            match entry.reputation.cmp(&0) {
                std::cmp::Ordering::Greater => entry.reputation -= 1,
                std::cmp::Ordering::Less => entry.reputation += 1,
                std::cmp::Ordering::Equal => (),
            }

            entry.trust == TrustState::Pinned
                || entry.reputation > 0
                || now.duration_since(entry.last_seen) <= self.idle_ttl
        });
    }

    /// Immutable snapshot for protocol handlers; higher layers never hold
    /// references into the store itself.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers
            .read()
            .values()
            .filter(|entry| entry.trust != TrustState::Rejected)
            .map(|entry| PeerRecord {
                peer_id: entry.peer_id.to_bytes(),
                addresses: entry.addresses.iter().map(|a| a.to_string()).collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PeerStore {
        PeerStore::new(-5, 10, 60_000, 60_000)
    }

    #[test]
    fn reputation_rules() {
        let peers = store();
        let peer = PeerId::random();
        peers.observe(peer, None);

        peers.record_success(&peer);
        assert_eq!(peers.reputation(&peer), 1);
        peers.record_protocol_error(&peer);
        assert_eq!(peers.reputation(&peer), 0);
        peers.record_integrity_failure(&peer);
        assert_eq!(peers.reputation(&peer), -2);

        // Clamped at the floor and no longer dialable there.
        for _ in 0..10 {
            peers.record_integrity_failure(&peer);
        }
        assert_eq!(peers.reputation(&peer), -5);
        assert!(!peers.is_dialable(&peer));
    }

    #[test]
    fn auth_failure_triggers_cooldown() {
        let peers = store();
        let peer = PeerId::random();
        peers.observe(peer, None);
        peers.record_auth_failure(&peer);
        assert!(!peers.is_dialable(&peer));
        assert!(peers.snapshot().is_empty());
    }

    #[test]
    fn preferred_order_puts_pinned_first() {
        let peers = store();
        let pinned = PeerId::random();
        let good = PeerId::random();
        let bad = PeerId::random();

        peers.observe(pinned, None);
        peers.observe(good, None);
        peers.observe(bad, None);
        peers.pin(pinned);
        for _ in 0..3 {
            peers.record_success(&good);
        }
        for _ in 0..10 {
            peers.record_integrity_failure(&bad);
        }

        let mut candidates = vec![bad, good, pinned];
        peers.preferred_order(&mut candidates);
        assert_eq!(candidates, vec![pinned, good]);
    }

    #[test]
    fn maintenance_decays_and_evicts() {
        let peers = PeerStore::new(-5, 10, 0, 0);
        let idle = PeerId::random();
        peers.observe(idle, None);

        // Reputation 0 and idle TTL of zero: evicted on first sweep.
        peers.maintain();
        assert!(peers.is_empty());
    }
}
