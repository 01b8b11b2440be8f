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

use std::path::PathBuf;
use std::sync::Arc;

use catalog::fsm::Fsm;
use p2p::config::P2pConfig;
use p2p::identity::NodeIdentity;
use p2p::node::P2pNode;
use p2p::peer_store::PeerStore;
use store::config::env_settings::EnvSettings;
use store::parking_lot::RwLock;
use store::serialize::key::SystemKey;
use store::tracing::info;
use store::{BibStore, Store, Table};
use tokio::sync::{broadcast, watch};

use crate::cluster::ClusterIpc;
use crate::server::UnwrapFailure;
use crate::BibServer;

/// Builds the server core: durable store, FSM, identity, and the P2P node
/// (spawned here). The caller wires in consensus afterwards.
pub async fn init_bib_server<T>(
    settings: &EnvSettings,
    cluster: Option<ClusterIpc>,
) -> (Arc<BibServer<T>>, Arc<PeerStore>, P2pConfig)
where
    T: for<'x> Store<'x> + 'static,
{
    // Open the durable backend and rebuild the FSM from it.
    let db = T::open(settings).failed_to("open backend");
    let store = Arc::new(BibStore::new(db, settings).failed_to("open store"));
    let fsm = Arc::new(RwLock::new(
        Fsm::load(&store.db).failed_to("load state machine"),
    ));

    // Node identity: created on first run, persisted encrypted.
    let base_path = PathBuf::from(
        settings
            .get("db-path")
            .unwrap_or_else(|| "bib-data".to_string()),
    );
    let identity = NodeIdentity::load_or_create(
        base_path,
        &settings
            .get("identity-secret")
            .unwrap_or_else(|| "bib".to_string()),
    )
    .failed_to("load node identity");
    info!("Node peer id is {}.", identity.peer_id());

    let p2p_config = P2pConfig::new(settings);
    let peer_store = Arc::new(PeerStore::new(
        p2p_config.reputation_floor,
        p2p_config.reputation_ceiling,
        p2p_config.peer_ttl_ms,
        p2p_config.reject_cooldown_ms,
    ));

    let (node, handle) = P2pNode::new(
        &identity,
        p2p_config.clone(),
        store.clone(),
        fsm.clone(),
        peer_store.clone(),
    )
    .failed_to("start p2p node");
    tokio::spawn(node.run());

    let (fsm_events, _) = broadcast::channel(1024);
    let (cluster_events, _) = broadcast::channel(64);
    let (shutdown_tx, _) = watch::channel(false);

    let node_id = store
        .db
        .get::<u64>(Table::System, SystemKey::NODE_ID)
        .failed_to("read node id")
        .unwrap_or_default();

    let core = Arc::new(BibServer {
        store,
        fsm,
        worker_pool: rayon::ThreadPoolBuilder::new()
            .num_threads(
                settings
                    .parse("worker-pool-size")
                    .filter(|size| *size > 0)
                    .unwrap_or_else(num_cpus::get),
            )
            .build()
            .failed_to("build worker pool"),
        node_id,
        cluster,
        p2p: Some(handle),
        fsm_events,
        cluster_events,
        shutdown_tx,
        #[cfg(test)]
        is_offline: false.into(),
    });

    (core, peer_store, p2p_config)
}
