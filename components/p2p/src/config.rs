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

use libp2p::Multiaddr;
use store::config::env_settings::EnvSettings;

pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;
pub const DEFAULT_FAN_OUT_PER_PEER: usize = 4;
pub const DEFAULT_OUTSTANDING_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct P2pConfig {
    pub cluster_name: String,
    pub listen_addresses: Vec<Multiaddr>,
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Preferred upstreams for proxy forwarding; pinned in the peer store.
    pub favorite_peers: Vec<Multiaddr>,
    pub mdns_enabled: bool,
    pub dht_enabled: bool,

    pub chunk_size: u32,
    pub fan_out_per_peer: usize,
    pub outstanding_bytes_budget: u64,
    pub max_frames_per_request: u32,
    pub request_timeout_ms: u64,
    pub inbound_concurrency: usize,
    pub page_size: usize,

    pub freshness_window_secs: i64,
    pub reject_cooldown_ms: u64,
    pub peer_ttl_ms: u64,
    pub reputation_floor: i32,
    pub reputation_ceiling: i32,
}

impl P2pConfig {
    pub fn new(settings: &EnvSettings) -> Self {
        let parse_addrs = |name: &str| {
            settings
                .parse_list(name)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|addr| match addr.parse::<Multiaddr>() {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        store::tracing::error!("Ignoring invalid multiaddr '{}': {}", addr, e);
                        None
                    }
                })
                .collect::<Vec<_>>()
        };

        let mut listen_addresses = parse_addrs("p2p-listen-addresses");
        if listen_addresses.is_empty() {
            listen_addresses.push("/ip4/0.0.0.0/tcp/7912".parse().unwrap());
        }

        P2pConfig {
            cluster_name: settings
                .get("cluster-name")
                .unwrap_or_else(|| "bib".to_string()),
            listen_addresses,
            bootstrap_peers: parse_addrs("p2p-bootstrap-peers"),
            favorite_peers: parse_addrs("p2p-favorite-peers"),
            mdns_enabled: settings.parse("p2p-mdns-enabled").unwrap_or(true),
            dht_enabled: settings.parse("p2p-dht-enabled").unwrap_or(true),
            chunk_size: settings.parse("p2p-chunk-size").unwrap_or(DEFAULT_CHUNK_SIZE),
            fan_out_per_peer: settings
                .parse("p2p-fan-out-per-peer")
                .unwrap_or(DEFAULT_FAN_OUT_PER_PEER),
            outstanding_bytes_budget: settings
                .parse("p2p-outstanding-bytes-budget")
                .unwrap_or(DEFAULT_OUTSTANDING_BYTES),
            max_frames_per_request: settings.parse("p2p-max-frames-per-request").unwrap_or(16),
            request_timeout_ms: settings.parse("p2p-request-timeout").unwrap_or(30_000),
            inbound_concurrency: settings.parse("p2p-inbound-concurrency").unwrap_or(64),
            page_size: settings.parse("p2p-page-size").unwrap_or(256),
            freshness_window_secs: settings.parse("p2p-freshness-window").unwrap_or(300),
            reject_cooldown_ms: settings.parse("p2p-reject-cooldown").unwrap_or(5 * 60 * 1000),
            peer_ttl_ms: settings.parse("p2p-peer-ttl").unwrap_or(30 * 60 * 1000),
            reputation_floor: settings.parse("p2p-reputation-floor").unwrap_or(-5),
            reputation_ceiling: settings.parse("p2p-reputation-ceiling").unwrap_or(10),
        }
    }

    /// DHT key under which all members of this deployment announce
    /// themselves.
    pub fn cluster_discovery_key(&self) -> Vec<u8> {
        let mut hasher = store::blake3::Hasher::new();
        hasher.update(b"bib cluster");
        hasher.update(self.cluster_name.as_bytes());
        hasher.finalize().as_bytes().to_vec()
    }
}
