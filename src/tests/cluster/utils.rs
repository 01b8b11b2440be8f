use crate::cluster::{Cluster, Config, Event, Peer, State};
use crate::BibServer;
use catalog::fsm::Fsm;
use catalog::MemberRole;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use store::config::env_settings::EnvSettings;
use store::log::raft::{NodeId, RaftId};
use store::parking_lot::RwLock;
use store::{BibStore, Store};
use store_sqlite::SqliteStore;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, watch};

pub struct TestNode {
    pub cluster: Cluster<SqliteStore>,
    pub core: Arc<BibServer<SqliteStore>>,
    pub temp_dir: TempDir,
    pub main_rx: mpsc::Receiver<Event>,
}

/// Builds a server core and consensus state machine without opening any
/// network listener; peers are wired in by the individual tests.
pub async fn init_test_node(node_id: NodeId) -> TestNode {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut settings = EnvSettings::empty();
    settings.set_value(
        "db-path".to_string(),
        temp_dir.path().to_str().unwrap().to_string(),
    );
    settings.set_value("cluster-key".to_string(), "correct horse".to_string());
    settings.set_value("raft-commit-timeout".to_string(), "2000".to_string());

    let db = SqliteStore::open(&settings).unwrap();
    let store = Arc::new(BibStore::new(db, &settings).unwrap());
    let fsm = Arc::new(RwLock::new(Fsm::load(&store.db).unwrap()));

    let (fsm_events, _) = broadcast::channel(256);
    let (cluster_events, _) = broadcast::channel(64);
    let (shutdown_tx, _) = watch::channel(false);

    let core = Arc::new(BibServer {
        store,
        fsm,
        worker_pool: rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap(),
        node_id,
        cluster: None,
        p2p: None,
        fsm_events,
        cluster_events,
        shutdown_tx,
        is_offline: false.into(),
    });

    let (main_tx, main_rx) = mpsc::channel(64);
    let (commit_index_tx, _) = watch::channel(0);

    let cluster = Cluster {
        node_id,
        addr: format!("127.0.0.1:{}", 17_000 + node_id).parse().unwrap(),
        is_voter: true,
        bootstrap: true,
        config: Config::new(&settings),
        term: 0,
        voted_for: None,
        state: State::Wait {
            election_due: Instant::now(),
        },
        last_log: RaftId::none(),
        commit_index: 0,
        last_snapshot: RaftId::none(),
        last_snapshot_time: Instant::now(),
        peers: Vec::new(),
        pending_acks: BTreeMap::new(),
        config_change: None,
        pending_snapshot: None,
        core: core.clone(),
        tx: main_tx,
        commit_index_tx,
    };

    TestNode {
        cluster,
        core,
        temp_dir,
        main_rx,
    }
}

/// A detached peer entry whose connection actor is never dialed; useful for
/// vote-counting and replication bookkeeping tests.
pub fn offline_peer(node_id: NodeId, role: MemberRole) -> Peer {
    let (tx, _rx) = mpsc::channel(8);
    let (_online_tx, online_rx) = watch::channel(false);
    std::mem::forget(_online_tx);
    std::mem::forget(_rx);
    Peer {
        node_id,
        addr: format!("127.0.0.1:{}", 18_000 + node_id),
        role,
        tx,
        online_rx,
        vote_granted: false,
        next_index: 1,
        match_index: 0,
        installing: None,
    }
}

impl TestNode {
    /// Single-voter bootstrap: run the election and become leader.
    pub async fn elect_leader(&mut self) {
        self.cluster.request_votes(true).await.unwrap();
        assert!(self.cluster.is_leading(), "node did not become leader");
    }
}
