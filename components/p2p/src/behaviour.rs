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

use std::time::Duration;

use libp2p::kad::store::MemoryStore;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{gossipsub, identify, identity, kad, mdns, ping, request_response, StreamProtocol};

use crate::codec::{BibCodec, DATA_PROTO, DISCOVERY_PROTO, JOBS_PROTO, SYNC_PROTO};
use crate::config::P2pConfig;
use crate::error::P2pError;
use crate::types::{
    DataRequest, DataResponse, DiscoveryRequest, DiscoveryResponse, JobsRequest, JobsResponse,
    SyncRequest, SyncResponse,
};

const ID_PROTO: &str = "/bib/id/1";
const KAD_PROTO: StreamProtocol = StreamProtocol::new("/bib/kad/1");

pub type DiscoveryBehaviour = request_response::Behaviour<BibCodec<DiscoveryRequest, DiscoveryResponse>>;
pub type SyncBehaviour = request_response::Behaviour<BibCodec<SyncRequest, SyncResponse>>;
pub type DataBehaviour = request_response::Behaviour<BibCodec<DataRequest, DataResponse>>;
pub type JobsBehaviour = request_response::Behaviour<BibCodec<JobsRequest, JobsResponse>>;

/// Composition of everything one node speaks: link-local and DHT discovery,
/// the gossip overlay, and the four request/response protocols. Adding a
/// protocol is a new field and a registration, not a subclass.
#[derive(NetworkBehaviour)]
pub struct BibBehaviour {
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub kad: Toggle<kad::Behaviour<MemoryStore>>,
    pub gossipsub: gossipsub::Behaviour,
    pub discovery: DiscoveryBehaviour,
    pub sync: SyncBehaviour,
    pub data: DataBehaviour,
    pub jobs: JobsBehaviour,
}

impl BibBehaviour {
    pub fn new(key: &identity::Keypair, config: &P2pConfig) -> Result<Self, P2pError> {
        let local_peer_id = key.public().to_peer_id();

        let mdns = if config.mdns_enabled {
            Some(
                mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
                    .map_err(|e| P2pError::Transport(format!("mDNS init failed: {}", e)))?,
            )
        } else {
            None
        };

        let kad = if config.dht_enabled {
            let mut kad_config = kad::Config::new(KAD_PROTO);
            kad_config.set_provider_publication_interval(Some(Duration::from_secs(12 * 3600)));
            Some(kad::Behaviour::with_config(
                local_peer_id,
                MemoryStore::new(local_peer_id),
                kad_config,
            ))
        } else {
            None
        };

        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(key.clone()),
            gossipsub::ConfigBuilder::default()
                .validation_mode(gossipsub::ValidationMode::Strict)
                .max_transmit_size(1024 * 1024)
                .build()
                .map_err(|e| P2pError::Transport(format!("gossipsub init failed: {}", e)))?,
        )
        .map_err(|e| P2pError::Transport(format!("gossipsub init failed: {}", e)))?;

        let request_config = request_response::Config::default()
            .with_request_timeout(Duration::from_millis(config.request_timeout_ms));

        Ok(BibBehaviour {
            identify: identify::Behaviour::new(
                identify::Config::new(ID_PROTO.to_string(), key.public())
                    .with_agent_version(format!("bibd/{}", env!("CARGO_PKG_VERSION"))),
            ),
            ping: ping::Behaviour::new(
                ping::Config::new().with_interval(Duration::from_secs(15)),
            ),
            mdns: Toggle::from(mdns),
            kad: Toggle::from(kad),
            gossipsub,
            discovery: request_response::Behaviour::with_codec(
                BibCodec::default(),
                [(DISCOVERY_PROTO, request_response::ProtocolSupport::Full)],
                request_config.clone(),
            ),
            sync: request_response::Behaviour::with_codec(
                BibCodec::default(),
                [(SYNC_PROTO, request_response::ProtocolSupport::Full)],
                request_config.clone(),
            ),
            data: request_response::Behaviour::with_codec(
                BibCodec::default(),
                [(DATA_PROTO, request_response::ProtocolSupport::Full)],
                request_config.clone(),
            ),
            jobs: request_response::Behaviour::with_codec(
                BibCodec::default(),
                [(JOBS_PROTO, request_response::ProtocolSupport::Full)],
                request_config,
            ),
        })
    }
}
