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

use std::sync::Arc;
use std::time::Duration;

use catalog::fsm::Fsm;
use futures::StreamExt;
use libp2p::kad::RecordKey;
use libp2p::request_response::{self, OutboundRequestId, ResponseChannel};
use libp2p::swarm::SwarmEvent;
use libp2p::{gossipsub, identify, kad, mdns, noise, tcp, yamux, Multiaddr, PeerId, Swarm};
use store::ahash::{AHashMap, AHashSet};
use store::blob::ChunkStore;
use store::parking_lot::RwLock;
use store::roaring::RoaringBitmap;
use store::tracing::{debug, error, info, warn};
use store::{BibStore, Store};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::behaviour::{BibBehaviour, BibBehaviourEvent};
use crate::config::P2pConfig;
use crate::error::P2pError;
use crate::identity::NodeIdentity;
use crate::peer_store::PeerStore;
use crate::types::{
    ChunkFrame, DataRequest, DataResponse, DiscoveryRequest, DiscoveryResponse, JobsRequest,
    JobsResponse, Notification, SyncRequest, SyncResponse, TOPIC_GLOBAL, TOPIC_NODES,
};

pub const COMMAND_CHANNEL_BUFFER: usize = 256;
pub const EVENT_CHANNEL_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub enum P2pEvent {
    /// A fresh, signature-valid gossip notification.
    Notification {
        topic: String,
        notification: Notification,
    },
    PeerDiscovered {
        peer_id: PeerId,
    },
    /// Job assignment hint pushed by the cluster leader.
    JobHint {
        job: catalog::JobRecord,
    },
}

pub enum P2pCommand {
    Dial {
        addr: Multiaddr,
    },
    Discovery {
        peer: PeerId,
        request: DiscoveryRequest,
        reply: oneshot::Sender<Result<DiscoveryResponse, P2pError>>,
    },
    Sync {
        peer: PeerId,
        request: SyncRequest,
        reply: oneshot::Sender<Result<SyncResponse, P2pError>>,
    },
    Data {
        peer: PeerId,
        request: DataRequest,
        reply: oneshot::Sender<Result<DataResponse, P2pError>>,
    },
    Jobs {
        peer: PeerId,
        request: JobsRequest,
        reply: oneshot::Sender<Result<JobsResponse, P2pError>>,
    },
    Publish {
        topic: String,
        notification: Notification,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    StartProviding {
        key: Vec<u8>,
    },
    StopProviding {
        key: Vec<u8>,
    },
    GetProviders {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<PeerId>, P2pError>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    /// Enables or disables DHT advertising. Refused internally when the
    /// backend is not authoritative: a cache must never present itself as a
    /// source of truth.
    SetAdvertise {
        enabled: bool,
    },
    Shutdown,
}

/// Cheap-to-clone handle to the running node.
#[derive(Clone)]
pub struct P2pHandle {
    peer_id: PeerId,
    cmd_tx: mpsc::Sender<P2pCommand>,
    event_tx: broadcast::Sender<P2pEvent>,
}

impl P2pHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<P2pEvent> {
        self.event_tx.subscribe()
    }

    pub async fn dial(&self, addr: Multiaddr) -> Result<(), P2pError> {
        Ok(self.cmd_tx.send(P2pCommand::Dial { addr }).await?)
    }

    pub async fn request_discovery(
        &self,
        peer: PeerId,
        request: DiscoveryRequest,
    ) -> Result<DiscoveryResponse, P2pError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(P2pCommand::Discovery {
                peer,
                request,
                reply,
            })
            .await?;
        rx.await?
    }

    pub async fn request_sync(
        &self,
        peer: PeerId,
        request: SyncRequest,
    ) -> Result<SyncResponse, P2pError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(P2pCommand::Sync {
                peer,
                request,
                reply,
            })
            .await?;
        rx.await?
    }

    pub async fn request_data(
        &self,
        peer: PeerId,
        request: DataRequest,
    ) -> Result<DataResponse, P2pError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(P2pCommand::Data {
                peer,
                request,
                reply,
            })
            .await?;
        rx.await?
    }

    pub async fn request_jobs(
        &self,
        peer: PeerId,
        request: JobsRequest,
    ) -> Result<JobsResponse, P2pError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(P2pCommand::Jobs {
                peer,
                request,
                reply,
            })
            .await?;
        rx.await?
    }

    pub async fn publish(&self, topic: String, notification: Notification) -> Result<(), P2pError> {
        Ok(self
            .cmd_tx
            .send(P2pCommand::Publish {
                topic,
                notification,
            })
            .await?)
    }

    pub async fn subscribe(&self, topic: String) -> Result<(), P2pError> {
        Ok(self.cmd_tx.send(P2pCommand::Subscribe { topic }).await?)
    }

    pub async fn unsubscribe(&self, topic: String) -> Result<(), P2pError> {
        Ok(self.cmd_tx.send(P2pCommand::Unsubscribe { topic }).await?)
    }

    pub async fn start_providing(&self, key: Vec<u8>) -> Result<(), P2pError> {
        Ok(self.cmd_tx.send(P2pCommand::StartProviding { key }).await?)
    }

    pub async fn stop_providing(&self, key: Vec<u8>) -> Result<(), P2pError> {
        Ok(self.cmd_tx.send(P2pCommand::StopProviding { key }).await?)
    }

    pub async fn get_providers(&self, key: Vec<u8>) -> Result<Vec<PeerId>, P2pError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(P2pCommand::GetProviders { key, reply })
            .await?;
        rx.await?
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, P2pError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(P2pCommand::ConnectedPeers { reply })
            .await?;
        Ok(rx.await?)
    }

    pub async fn set_advertise(&self, enabled: bool) -> Result<(), P2pError> {
        Ok(self
            .cmd_tx
            .send(P2pCommand::SetAdvertise { enabled })
            .await?)
    }

    pub async fn shutdown(&self) {
        self.cmd_tx.send(P2pCommand::Shutdown).await.ok();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Proto {
    Discovery,
    Sync,
    Data,
    Jobs,
}

enum Pending {
    Discovery(oneshot::Sender<Result<DiscoveryResponse, P2pError>>),
    Sync(oneshot::Sender<Result<SyncResponse, P2pError>>),
    Data(oneshot::Sender<Result<DataResponse, P2pError>>),
    Jobs(oneshot::Sender<Result<JobsResponse, P2pError>>),
    /// Bootstrap peer-list exchange initiated by the node itself.
    InternalPeers,
}

pub struct P2pNode<T>
where
    T: for<'x> Store<'x> + 'static,
{
    swarm: Swarm<BibBehaviour>,
    config: P2pConfig,
    store: Arc<BibStore<T>>,
    fsm: Arc<RwLock<Fsm>>,
    peer_store: Arc<PeerStore>,

    cmd_rx: mpsc::Receiver<P2pCommand>,
    event_tx: broadcast::Sender<P2pEvent>,

    pending: AHashMap<(Proto, OutboundRequestId), Pending>,
    pending_providers: AHashMap<kad::QueryId, oneshot::Sender<Result<Vec<PeerId>, P2pError>>>,
    bootstrap_pending: AHashSet<Multiaddr>,
    advertise: bool,
}

impl<T> P2pNode<T>
where
    T: for<'x> Store<'x> + 'static,
{
    pub fn new(
        identity: &NodeIdentity,
        config: P2pConfig,
        store: Arc<BibStore<T>>,
        fsm: Arc<RwLock<Fsm>>,
        peer_store: Arc<PeerStore>,
    ) -> Result<(Self, P2pHandle), P2pError> {
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(identity.keypair().clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| P2pError::Transport(format!("TCP transport init failed: {}", e)))?
            .with_behaviour(|key| {
                BibBehaviour::new(key, &config)
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            })
            .map_err(|e| P2pError::Transport(format!("Behaviour init failed: {}", e)))?
            .with_swarm_config(|swarm_config| {
                swarm_config.with_idle_connection_timeout(Duration::from_secs(120))
            })
            .build();

        for addr in &config.listen_addresses {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| P2pError::Transport(format!("Failed to listen on {}: {}", addr, e)))?;
        }

        for topic in [TOPIC_GLOBAL, TOPIC_NODES] {
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&gossipsub::IdentTopic::new(topic))
                .map_err(|e| P2pError::Transport(format!("Subscribe failed: {:?}", e)))?;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_BUFFER);

        let handle = P2pHandle {
            peer_id: identity.peer_id(),
            cmd_tx,
            event_tx: event_tx.clone(),
        };

        Ok((
            P2pNode {
                swarm,
                bootstrap_pending: config.bootstrap_peers.iter().cloned().collect(),
                config,
                store,
                fsm,
                peer_store,
                cmd_rx,
                event_tx,
                pending: AHashMap::new(),
                pending_providers: AHashMap::new(),
                advertise: false,
            },
            handle,
        ))
    }

    /// Drives the swarm until shutdown. Owns all connection state; other
    /// tasks talk to it exclusively through the handle.
    pub async fn run(mut self) {
        // Dial the configured seeds; the peer list exchange happens once a
        // connection is established.
        for addr in self.config.bootstrap_peers.clone() {
            if let Err(e) = self.swarm.dial(addr.clone()) {
                warn!("Failed to dial bootstrap peer {}: {}", addr, e);
            }
        }
        // Favorites are pinned: always dialable, always preferred.
        for addr in self.config.favorite_peers.clone() {
            if let Some(libp2p::multiaddr::Protocol::P2p(peer_id)) = addr.iter().last() {
                self.peer_store.pin(peer_id);
                self.peer_store.observe(peer_id, Some(addr.clone()));
            }
            if let Err(e) = self.swarm.dial(addr.clone()) {
                warn!("Failed to dial favorite peer {}: {}", addr, e);
            }
        }
        if self.config.dht_enabled {
            let key = RecordKey::new(&self.config.cluster_discovery_key());
            if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                kad.get_providers(key);
            }
        }

        let mut maintenance = tokio::time::interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(P2pCommand::Shutdown) | None => {
                            info!("P2P node shutting down.");
                            break;
                        }
                        Some(command) => self.handle_command(command),
                    }
                }
                _ = maintenance.tick() => {
                    self.peer_store.maintain();
                }
            }
        }
    }

    fn handle_command(&mut self, command: P2pCommand) {
        match command {
            P2pCommand::Dial { addr } => {
                if let Err(e) = self.swarm.dial(addr.clone()) {
                    debug!("Failed to dial {}: {}", addr, e);
                }
            }
            P2pCommand::Discovery {
                peer,
                request,
                reply,
            } => {
                if !self.peer_store.is_dialable(&peer) {
                    reply
                        .send(Err(P2pError::Dial(format!("peer {} is blocked", peer))))
                        .ok();
                    return;
                }
                let id = self
                    .swarm
                    .behaviour_mut()
                    .discovery
                    .send_request(&peer, request);
                self.pending
                    .insert((Proto::Discovery, id), Pending::Discovery(reply));
            }
            P2pCommand::Sync {
                peer,
                request,
                reply,
            } => {
                if !self.peer_store.is_dialable(&peer) {
                    reply
                        .send(Err(P2pError::Dial(format!("peer {} is blocked", peer))))
                        .ok();
                    return;
                }
                let id = self.swarm.behaviour_mut().sync.send_request(&peer, request);
                self.pending.insert((Proto::Sync, id), Pending::Sync(reply));
            }
            P2pCommand::Data {
                peer,
                request,
                reply,
            } => {
                if !self.peer_store.is_dialable(&peer) {
                    reply
                        .send(Err(P2pError::Dial(format!("peer {} is blocked", peer))))
                        .ok();
                    return;
                }
                let id = self.swarm.behaviour_mut().data.send_request(&peer, request);
                self.pending.insert((Proto::Data, id), Pending::Data(reply));
            }
            P2pCommand::Jobs {
                peer,
                request,
                reply,
            } => {
                if !self.peer_store.is_dialable(&peer) {
                    reply
                        .send(Err(P2pError::Dial(format!("peer {} is blocked", peer))))
                        .ok();
                    return;
                }
                let id = self.swarm.behaviour_mut().jobs.send_request(&peer, request);
                self.pending.insert((Proto::Jobs, id), Pending::Jobs(reply));
            }
            P2pCommand::Publish {
                topic,
                notification,
            } => {
                let payload = match store::bincode::serialize(&notification) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("Failed to serialize notification: {}", e);
                        return;
                    }
                };
                if let Err(e) = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(gossipsub::IdentTopic::new(topic), payload)
                {
                    // Best-effort delivery only.
                    debug!("Gossip publish failed: {:?}", e);
                }
            }
            P2pCommand::Subscribe { topic } => {
                if let Err(e) = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&gossipsub::IdentTopic::new(topic))
                {
                    debug!("Gossip subscribe failed: {:?}", e);
                }
            }
            P2pCommand::Unsubscribe { topic } => {
                self.swarm
                    .behaviour_mut()
                    .gossipsub
                    .unsubscribe(&gossipsub::IdentTopic::new(topic));
            }
            P2pCommand::StartProviding { key } => {
                if !self.advertise {
                    debug!("Suppressed provider record: node is not advertising.");
                    return;
                }
                if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                    if let Err(e) = kad.start_providing(RecordKey::new(&key)) {
                        debug!("Failed to start providing: {}", e);
                    }
                }
            }
            P2pCommand::StopProviding { key } => {
                if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                    kad.stop_providing(&RecordKey::new(&key));
                }
            }
            P2pCommand::GetProviders { key, reply } => {
                match self.swarm.behaviour_mut().kad.as_mut() {
                    Some(kad) => {
                        let query_id = kad.get_providers(RecordKey::new(&key));
                        self.pending_providers.insert(query_id, reply);
                    }
                    None => {
                        reply.send(Err(P2pError::NoProviders)).ok();
                    }
                }
            }
            P2pCommand::ConnectedPeers { reply } => {
                reply
                    .send(self.swarm.connected_peers().copied().collect())
                    .ok();
            }
            P2pCommand::SetAdvertise { enabled } => {
                if enabled && !self.store.is_authoritative() {
                    warn!("Refusing to advertise from a non-authoritative backend.");
                    self.advertise = false;
                } else {
                    self.advertise = enabled;
                    if enabled {
                        if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                            kad.set_mode(Some(kad::Mode::Server));
                            kad.start_providing(RecordKey::new(
                                &self.config.cluster_discovery_key(),
                            ))
                            .ok();
                        }
                    }
                }
            }
            P2pCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<BibBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("P2P listening on {}.", address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                let remote = endpoint.get_remote_address().clone();
                self.peer_store.observe(peer_id, Some(remote.clone()));

                if self.bootstrap_pending.remove(&remote) {
                    let id = self
                        .swarm
                        .behaviour_mut()
                        .discovery
                        .send_request(&peer_id, DiscoveryRequest::ListPeers { page: 0 });
                    self.pending
                        .insert((Proto::Discovery, id), Pending::InternalPeers);
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => (),
        }
    }

    fn handle_behaviour_event(&mut self, event: BibBehaviourEvent) {
        match event {
            BibBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer_id, addr) in peers {
                    self.peer_store.observe(peer_id, Some(addr.clone()));
                    if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                        kad.add_address(&peer_id, addr);
                    }
                    self.event_tx.send(P2pEvent::PeerDiscovered { peer_id }).ok();
                }
            }
            BibBehaviourEvent::Mdns(mdns::Event::Expired(_)) => (),
            BibBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                for addr in info.listen_addrs {
                    self.peer_store.observe(peer_id, Some(addr.clone()));
                    if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                        kad.add_address(&peer_id, addr);
                    }
                }
            }
            BibBehaviourEvent::Identify(_) => (),
            BibBehaviourEvent::Ping(_) => (),
            BibBehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                id, result, ..
            }) => match result {
                kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                    providers,
                    ..
                })) => {
                    if let Some(reply) = self.pending_providers.remove(&id) {
                        reply.send(Ok(providers.into_iter().collect())).ok();
                    }
                }
                kad::QueryResult::GetProviders(Ok(
                    kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
                )) => {
                    if let Some(reply) = self.pending_providers.remove(&id) {
                        reply.send(Ok(Vec::new())).ok();
                    }
                }
                kad::QueryResult::GetProviders(Err(e)) => {
                    if let Some(reply) = self.pending_providers.remove(&id) {
                        reply.send(Err(P2pError::Request {
                            peer: "dht".to_string(),
                            reason: e.to_string(),
                        }))
                        .ok();
                    }
                }
                _ => (),
            },
            BibBehaviourEvent::Kad(_) => (),
            BibBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            }) => {
                self.handle_gossip(propagation_source, message);
            }
            BibBehaviourEvent::Gossipsub(_) => (),
            BibBehaviourEvent::Discovery(event) => self.handle_discovery_event(event),
            BibBehaviourEvent::Sync(event) => self.handle_sync_event(event),
            BibBehaviourEvent::Data(event) => self.handle_data_event(event),
            BibBehaviourEvent::Jobs(event) => self.handle_jobs_event(event),
        }
    }

    fn handle_gossip(&mut self, source: PeerId, message: gossipsub::Message) {
        // The overlay already dropped messages with bad signatures (strict
        // validation); stale messages are dropped here.
        match store::bincode::deserialize::<Notification>(&message.data) {
            Ok(notification) => {
                let now = store::chrono::Utc::now().timestamp();
                if notification.is_fresh(now, self.config.freshness_window_secs) {
                    self.event_tx
                        .send(P2pEvent::Notification {
                            topic: message.topic.as_str().to_string(),
                            notification,
                        })
                        .ok();
                } else {
                    debug!("Dropping stale gossip notification from {}.", source);
                }
            }
            Err(e) => {
                debug!("Invalid gossip payload from {}: {}", source, e);
                self.peer_store.record_protocol_error(&source);
            }
        }
    }

    fn handle_discovery_event(
        &mut self,
        event: request_response::Event<DiscoveryRequest, DiscoveryResponse>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let response = self.serve_discovery(request);
                    self.respond_discovery(channel, response);
                    self.peer_store.observe(peer, None);
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    self.peer_store.record_success(&peer);
                    match self.pending.remove(&(Proto::Discovery, request_id)) {
                        Some(Pending::Discovery(reply)) => {
                            reply.send(Ok(response)).ok();
                        }
                        Some(Pending::InternalPeers) => {
                            if let DiscoveryResponse::Peers { peers, .. } = response {
                                for record in peers {
                                    self.absorb_peer_record(record);
                                }
                            }
                        }
                        _ => (),
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer, request_id, error, ..
            } => {
                debug!("Discovery request to {} failed: {}", peer, error);
                self.peer_store.record_protocol_error(&peer);
                if let Some(Pending::Discovery(reply)) =
                    self.pending.remove(&(Proto::Discovery, request_id))
                {
                    reply
                        .send(Err(P2pError::Request {
                            peer: peer.to_string(),
                            reason: error.to_string(),
                        }))
                        .ok();
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!("Inbound discovery stream from {} failed: {}", peer, error);
            }
            request_response::Event::ResponseSent { .. } => (),
        }
    }

    fn respond_discovery(
        &mut self,
        channel: ResponseChannel<DiscoveryResponse>,
        response: DiscoveryResponse,
    ) {
        if self
            .swarm
            .behaviour_mut()
            .discovery
            .send_response(channel, response)
            .is_err()
        {
            debug!("Discovery response channel closed before reply.");
        }
    }

    fn serve_discovery(&mut self, request: DiscoveryRequest) -> DiscoveryResponse {
        let authoritative = self.store.is_authoritative();
        let page_size = self.config.page_size;
        match request {
            DiscoveryRequest::ListPeers { page } => {
                let peers = self.peer_store.snapshot();
                let (peers, done) = paginate(peers, page as usize, page_size);
                DiscoveryResponse::Peers {
                    peers,
                    authoritative,
                    done,
                }
            }
            DiscoveryRequest::ListTopics { page } => {
                let topics = self
                    .fsm
                    .read()
                    .list_topics()
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>();
                let (topics, done) = paginate(topics, page as usize, page_size);
                DiscoveryResponse::Topics {
                    topics,
                    authoritative,
                    done,
                }
            }
            DiscoveryRequest::ListDatasets { topic_id, page } => {
                let datasets = self
                    .fsm
                    .read()
                    .list_datasets(&topic_id)
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>();
                let (datasets, done) = paginate(datasets, page as usize, page_size);
                DiscoveryResponse::Datasets {
                    datasets,
                    authoritative,
                    done,
                }
            }
        }
    }

    fn absorb_peer_record(&mut self, record: crate::types::PeerRecord) {
        if let Ok(peer_id) = PeerId::from_bytes(&record.peer_id) {
            for addr in record.addresses {
                if let Ok(addr) = addr.parse::<Multiaddr>() {
                    self.peer_store.observe(peer_id, Some(addr.clone()));
                    if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                        kad.add_address(&peer_id, addr);
                    }
                }
            }
            self.event_tx.send(P2pEvent::PeerDiscovered { peer_id }).ok();
        }
    }

    fn handle_sync_event(&mut self, event: request_response::Event<SyncRequest, SyncResponse>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let authoritative = self.store.is_authoritative();
                    let limit =
                        (request.limit as usize).clamp(1, self.config.page_size);
                    let entries = self.fsm.read().datasets_after(
                        request.topic_id,
                        &request.cursor,
                        limit,
                    );
                    let done = entries.len() < limit;
                    let response = SyncResponse::Entries {
                        entries,
                        authoritative,
                        done,
                    };
                    if self
                        .swarm
                        .behaviour_mut()
                        .sync
                        .send_response(channel, response)
                        .is_err()
                    {
                        debug!("Sync response channel closed before reply.");
                    }
                    self.peer_store.observe(peer, None);
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    self.peer_store.record_success(&peer);
                    if let Some(Pending::Sync(reply)) =
                        self.pending.remove(&(Proto::Sync, request_id))
                    {
                        reply.send(Ok(response)).ok();
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer, request_id, error, ..
            } => {
                self.peer_store.record_protocol_error(&peer);
                if let Some(Pending::Sync(reply)) = self.pending.remove(&(Proto::Sync, request_id))
                {
                    reply
                        .send(Err(P2pError::Request {
                            peer: peer.to_string(),
                            reason: error.to_string(),
                        }))
                        .ok();
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!("Inbound sync stream from {} failed: {}", peer, error);
            }
            request_response::Event::ResponseSent { .. } => (),
        }
    }

    fn handle_data_event(&mut self, event: request_response::Event<DataRequest, DataResponse>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let response = self.serve_data(request);
                    if self
                        .swarm
                        .behaviour_mut()
                        .data
                        .send_response(channel, response)
                        .is_err()
                    {
                        debug!("Data response channel closed before reply.");
                    }
                    self.peer_store.observe(peer, None);
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    // Success is recorded by the transfer engine only after
                    // the chunk passes verification.
                    if let Some(Pending::Data(reply)) =
                        self.pending.remove(&(Proto::Data, request_id))
                    {
                        reply.send(Ok(response)).ok();
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer, request_id, error, ..
            } => {
                self.peer_store.record_protocol_error(&peer);
                if let Some(Pending::Data(reply)) = self.pending.remove(&(Proto::Data, request_id))
                {
                    reply
                        .send(Err(P2pError::Request {
                            peer: peer.to_string(),
                            reason: error.to_string(),
                        }))
                        .ok();
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!("Inbound data stream from {} failed: {}", peer, error);
            }
            request_response::Event::ResponseSent { .. } => (),
        }
    }

    /// Serves chunk frames for every requested index this node can satisfy.
    /// Any stored chunk is served regardless of the caller's preferred
    /// chunk size; indexes beyond the dataset are ignored.
    fn serve_data(&mut self, request: DataRequest) -> DataResponse {
        let wanted = match RoaringBitmap::deserialize_from(&request.wanted[..]) {
            Ok(wanted) => wanted,
            Err(_) => return DataResponse::Busy,
        };
        let chunks = {
            let fsm = self.fsm.read();
            let mut record = None;
            for dataset in fsm.datasets.values() {
                if dataset.dataset_id == request.dataset_id {
                    record = Some(dataset.chunks.clone());
                    break;
                }
            }
            match record {
                Some(chunks) => chunks,
                None => return DataResponse::UnknownDataset,
            }
        };

        let max_frames = request
            .max_frames
            .clamp(1, self.config.max_frames_per_request) as usize;
        let mut frames = Vec::new();
        for chunk_index in wanted.iter() {
            if frames.len() >= max_frames {
                break;
            }
            let chunk = match chunks.get(chunk_index as usize) {
                Some(chunk) => chunk,
                None => continue,
            };
            match self.store.chunks.get_chunk(&chunk.hash) {
                Ok(Some(bytes)) => {
                    frames.push(ChunkFrame {
                        chunk_index,
                        hash: chunk.hash,
                        size: bytes.len() as u32,
                        bytes,
                    });
                }
                Ok(None) => (),
                Err(e) => {
                    error!("Failed to read chunk {}: {}", chunk.hash, e);
                }
            }
        }
        DataResponse::Chunks { frames }
    }

    fn handle_jobs_event(&mut self, event: request_response::Event<JobsRequest, JobsResponse>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let response = match request {
                        JobsRequest::Assign { job } => {
                            self.event_tx.send(P2pEvent::JobHint { job }).ok();
                            JobsResponse::Ack
                        }
                        JobsRequest::Pull { node_id } => JobsResponse::Jobs(
                            self.fsm
                                .read()
                                .jobs_for_node(node_id)
                                .into_iter()
                                .cloned()
                                .collect(),
                        ),
                    };
                    if self
                        .swarm
                        .behaviour_mut()
                        .jobs
                        .send_response(channel, response)
                        .is_err()
                    {
                        debug!("Jobs response channel closed before reply.");
                    }
                    self.peer_store.observe(peer, None);
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    self.peer_store.record_success(&peer);
                    if let Some(Pending::Jobs(reply)) =
                        self.pending.remove(&(Proto::Jobs, request_id))
                    {
                        reply.send(Ok(response)).ok();
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer, request_id, error, ..
            } => {
                self.peer_store.record_protocol_error(&peer);
                if let Some(Pending::Jobs(reply)) = self.pending.remove(&(Proto::Jobs, request_id))
                {
                    reply
                        .send(Err(P2pError::Request {
                            peer: peer.to_string(),
                            reason: error.to_string(),
                        }))
                        .ok();
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!("Inbound jobs stream from {} failed: {}", peer, error);
            }
            request_response::Event::ResponseSent { .. } => (),
        }
    }
}

fn paginate<U>(items: Vec<U>, page: usize, page_size: usize) -> (Vec<U>, bool) {
    let start = page.saturating_mul(page_size);
    if start >= items.len() {
        return (Vec::new(), true);
    }
    let end = std::cmp::min(start + page_size, items.len());
    let done = end == items.len();
    (
        items
            .into_iter()
            .skip(start)
            .take(end - start)
            .collect(),
        done,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_marks_last_page() {
        let items = (0..10).collect::<Vec<_>>();
        let (page0, done0) = paginate(items.clone(), 0, 4);
        let (page2, done2) = paginate(items.clone(), 2, 4);
        let (page3, done3) = paginate(items, 3, 4);

        assert_eq!(page0, vec![0, 1, 2, 3]);
        assert!(!done0);
        assert_eq!(page2, vec![8, 9]);
        assert!(done2);
        assert!(page3.is_empty());
        assert!(done3);
    }
}
