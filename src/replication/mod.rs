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

pub mod full;
pub mod proxy;
pub mod selective;

use crate::BibServer;
use catalog::TopicId;
use p2p::config::P2pConfig;
use p2p::node::{P2pEvent, P2pHandle};
use p2p::peer_store::PeerStore;
use p2p::transfer::Transfer;
use p2p::types::NotificationKind;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use store::ahash::AHashSet;
use store::serialize::key::SystemKey;
use store::tracing::{debug, error, info};
use store::{Store, Table};
use tokio::sync::{mpsc, oneshot, watch};

use self::proxy::ProxyCache;

pub const ENGINE_CHANNEL_BUFFER: usize = 64;

/// Replication behavior of this node. Exactly one mode is active at any
/// time; transitions happen only between engine passes, with all fetches
/// drained and the mirror flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    Proxy,
    Selective,
    Full,
}

impl FromStr for ReplicationMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "proxy" => Ok(ReplicationMode::Proxy),
            "selective" => Ok(ReplicationMode::Selective),
            "full" => Ok(ReplicationMode::Full),
            other => Err(format!("unknown replication mode '{}'", other)),
        }
    }
}

impl Display for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ReplicationMode::Proxy => "proxy",
            ReplicationMode::Selective => "selective",
            ReplicationMode::Full => "full",
        })
    }
}

/// Full replicas may only be served from an authoritative backend; this is
/// checked before any listener opens and again on every mode transition.
pub fn check_mode_compat(mode: ReplicationMode, authoritative: bool) -> Result<(), String> {
    if mode == ReplicationMode::Full && !authoritative {
        Err(format!(
            "mode '{}' requires an authoritative backend; the embedded backend is cache-only",
            mode
        ))
    } else {
        Ok(())
    }
}

pub enum EngineCommand {
    SetMode {
        mode: ReplicationMode,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Subscribe {
        topic_id: TopicId,
    },
    Unsubscribe {
        topic_id: TopicId,
    },
    SyncNow,
}

pub struct ReplicationEngine<T>
where
    T: for<'x> Store<'x> + 'static,
{
    pub core: Arc<BibServer<T>>,
    pub handle: P2pHandle,
    pub peer_store: Arc<PeerStore>,
    pub transfer: Transfer<T>,

    pub mode: ReplicationMode,
    pub subscriptions: AHashSet<TopicId>,
    pub proxy_cache: ProxyCache,
    pub interval: Duration,

    rx: mpsc::Receiver<EngineCommand>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T> ReplicationEngine<T>
where
    T: for<'x> Store<'x> + 'static,
{
    pub fn new(
        core: Arc<BibServer<T>>,
        handle: P2pHandle,
        peer_store: Arc<PeerStore>,
        p2p_config: &P2pConfig,
        mode: ReplicationMode,
        interval_secs: u64,
        cache_ttl_secs: u64,
    ) -> (Self, mpsc::Sender<EngineCommand>) {
        let (tx, rx) = mpsc::channel(ENGINE_CHANNEL_BUFFER);
        let transfer = Transfer::new(
            core.store.clone(),
            peer_store.clone(),
            handle.clone(),
            p2p_config,
        );
        let shutdown_rx = core.shutdown_tx.subscribe();
        (
            ReplicationEngine {
                core,
                handle,
                peer_store,
                transfer,
                mode,
                subscriptions: AHashSet::new(),
                proxy_cache: ProxyCache::new(Duration::from_secs(cache_ttl_secs)),
                interval: Duration::from_secs(interval_secs.max(1)),
                rx,
                shutdown_rx,
            },
            tx,
        )
    }

    /// Supervised engine task: periodic passes, gossip kicks, mode
    /// transitions. The pass itself is sequential, so commands are only
    /// observed with the loops quiesced.
    pub async fn run(mut self) {
        if let Err(e) = self.load_subscriptions() {
            error!("Failed to load subscriptions: {}", e);
        }
        // Subscriptions persist across restarts; rejoin their gossip
        // channels before the first pass.
        for topic_id in self.subscriptions.iter().copied().collect::<Vec<_>>() {
            self.handle
                .subscribe(p2p::types::topic_for(&topic_id))
                .await
                .ok();
        }
        self.apply_advertising().await;

        let mut events = self.handle.subscribe_events();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_pass().await;
                }
                command = self.rx.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await {
                                self.run_pass().await;
                            }
                        }
                        None => break,
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(P2pEvent::Notification { notification, .. }) => {
                            if self.wants_kick(&notification.kind) {
                                self.run_pass().await;
                            }
                        }
                        Ok(P2pEvent::JobHint { job }) => {
                            // Execution is out of scope; the hint is logged
                            // so pull-based workers can observe freshness.
                            info!("Received assignment hint for job '{}'.", job.job_id);
                        }
                        Ok(_) => (),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Replication engine lagged {} events.", skipped);
                            self.run_pass().await;
                        }
                        Err(_) => break,
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    info!("Replication engine shutting down.");
                    break;
                }
            }
        }
    }

    fn wants_kick(&self, kind: &NotificationKind) -> bool {
        match kind {
            NotificationKind::CatalogChanged { topic_id } => match self.mode {
                ReplicationMode::Proxy => false,
                ReplicationMode::Selective => self.subscriptions.contains(topic_id),
                ReplicationMode::Full => true,
            },
            _ => false,
        }
    }

    /// Returns true when a follow-up pass should run immediately.
    async fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::SetMode { mode, reply } => {
                let result = self.transition(mode).await;
                reply.send(result).ok();
                true
            }
            EngineCommand::Subscribe { topic_id } => {
                if self.subscriptions.insert(topic_id) {
                    self.handle
                        .subscribe(p2p::types::topic_for(&topic_id))
                        .await
                        .ok();
                    if let Err(e) = self.persist_subscriptions() {
                        error!("Failed to persist subscriptions: {}", e);
                    }
                }
                true
            }
            EngineCommand::Unsubscribe { topic_id } => {
                if self.subscriptions.remove(&topic_id) {
                    self.handle
                        .unsubscribe(p2p::types::topic_for(&topic_id))
                        .await
                        .ok();
                    if let Err(e) = self.persist_subscriptions() {
                        error!("Failed to persist subscriptions: {}", e);
                    }
                }
                false
            }
            EngineCommand::SyncNow => true,
        }
    }

    /// Mode transitions run between passes: in-flight fetches have drained,
    /// the mirror is flushed, then the loops restart under the new mode.
    async fn transition(&mut self, mode: ReplicationMode) -> Result<(), String> {
        if mode == self.mode {
            return Ok(());
        }
        check_mode_compat(mode, self.core.store.is_authoritative())?;

        if let Err(e) = self.persist_subscriptions() {
            return Err(format!("failed to flush subscriptions: {}", e));
        }
        self.proxy_cache.clear();

        info!("Replication mode changing {} -> {}.", self.mode, mode);
        self.mode = mode;
        self.apply_advertising().await;
        Ok(())
    }

    /// Cache-only backends never advertise; authoritative replicas
    /// advertise in selective and full modes, proxies never do.
    async fn apply_advertising(&self) {
        let advertise = self.mode != ReplicationMode::Proxy
            && self.core.store.is_authoritative();
        self.handle.set_advertise(advertise).await.ok();
    }

    async fn run_pass(&mut self) {
        match self.mode {
            ReplicationMode::Proxy => {
                self.proxy_cache.evict_expired();
            }
            ReplicationMode::Selective => {
                self.sync_and_fetch().await;
            }
            ReplicationMode::Full => {
                self.discover_all_topics().await;
                self.sync_and_fetch().await;
            }
        }
    }

    pub fn load_subscriptions(&mut self) -> store::Result<()> {
        if let Some(topics) = self
            .core
            .store
            .db
            .get::<Vec<u8>>(Table::System, SystemKey::SUBSCRIPTIONS)?
        {
            if let Ok(topics) = store::bincode::deserialize::<Vec<TopicId>>(&topics) {
                self.subscriptions = topics.into_iter().collect();
            }
        }
        Ok(())
    }

    pub fn persist_subscriptions(&self) -> store::Result<()> {
        let topics = self.subscriptions.iter().copied().collect::<Vec<_>>();
        self.core.store.db.set(
            Table::System,
            SystemKey::SUBSCRIPTIONS,
            &store::bincode::serialize(&topics).unwrap_or_default(),
        )
    }

    /// Standalone mirrors apply synced records directly; cluster members
    /// already receive the catalog linearized through consensus.
    pub fn is_cluster_member(&self) -> bool {
        self.core.cluster.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names_round_trip() {
        for (name, mode) in [
            ("proxy", ReplicationMode::Proxy),
            ("selective", ReplicationMode::Selective),
            ("full", ReplicationMode::Full),
        ] {
            assert_eq!(name.parse::<ReplicationMode>().unwrap(), mode);
            assert_eq!(mode.to_string(), name);
        }
        assert!("everything".parse::<ReplicationMode>().is_err());
    }

    #[test]
    fn full_mode_requires_authority() {
        assert!(check_mode_compat(ReplicationMode::Full, true).is_ok());
        assert!(check_mode_compat(ReplicationMode::Full, false).is_err());

        // Proxy and selective run on either backend; selective is then a
        // cache that must not advertise.
        for mode in [ReplicationMode::Proxy, ReplicationMode::Selective] {
            assert!(check_mode_compat(mode, false).is_ok());
            assert!(check_mode_compat(mode, true).is_ok());
        }
    }
}
