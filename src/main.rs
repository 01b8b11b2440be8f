#![warn(clippy::disallowed_types)]

use std::sync::Arc;
use std::time::Duration;

use bib_server::cluster::init::{init_cluster, start_cluster};
use bib_server::replication::{check_mode_compat, ReplicationEngine, ReplicationMode};
use bib_server::server::init::init_bib_server;
use bib_server::server::UnwrapFailure;
use bib_server::{BibServer, ClusterEvent};
use futures::StreamExt;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use store::{
    config::env_settings::EnvSettings,
    tracing::{self, info, Level},
    Store,
};
use store_rocksdb::RocksDB;
use store_sqlite::SqliteStore;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Read configuration parameters
    let settings = EnvSettings::new();

    // Enable logging
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(settings.parse("log-level").unwrap_or(Level::INFO))
            .finish(),
    )
    .failed_to("set default subscriber");

    // The replication mode must be compatible with the backend before any
    // listening socket opens: a cache-only backend cannot hold a full
    // replica.
    let mode = settings
        .get("p2p-mode")
        .unwrap_or_else(|| "selective".to_string())
        .parse::<ReplicationMode>()
        .failed_to("parse p2p-mode");
    let backend = settings
        .get("storage-backend")
        .unwrap_or_else(|| "embedded".to_string());
    let authoritative = match backend.as_str() {
        "embedded" => false,
        "relational" => true,
        other => {
            tracing::error!(
                "Unknown storage backend '{}'; expected 'embedded' or 'relational'.",
                other
            );
            std::process::exit(1);
        }
    };
    check_mode_compat(mode, authoritative).failed_to("validate replication mode");

    match backend.as_str() {
        "embedded" => run_server::<RocksDB>(settings, mode).await,
        _ => run_server::<SqliteStore>(settings, mode).await,
    }
}

async fn run_server<T>(settings: EnvSettings, mode: ReplicationMode) -> std::io::Result<()>
where
    T: for<'x> Store<'x> + 'static,
{
    // Init server core, with consensus when a cluster key is configured.
    let (core, peer_store, p2p_config) = if let Some((cluster_ipc, cluster_init)) =
        init_cluster(&settings)
    {
        let (core, peer_store, p2p_config) =
            init_bib_server::<T>(&settings, cluster_ipc.into()).await;
        start_cluster(cluster_init, core.clone(), &settings).await;
        (core, peer_store, p2p_config)
    } else {
        init_bib_server::<T>(&settings, None).await
    };

    // Start the replication engine for the configured mode.
    let (engine, _engine_tx) = ReplicationEngine::new(
        core.clone(),
        core.p2p.clone().failed_to("obtain p2p handle"),
        peer_store,
        &p2p_config,
        mode,
        settings.parse("replication-interval").unwrap_or(30),
        settings.parse("proxy-cache-ttl").unwrap_or(60),
    );
    tokio::spawn(engine.run());

    spawn_leader_logger(core.clone());

    info!(
        "Bib server v{} started in {} mode ({} backend).",
        env!("CARGO_PKG_VERSION"),
        mode,
        if core.store.is_authoritative() {
            "authoritative"
        } else {
            "cache-only"
        }
    );

    // Wait for shutdown signal
    let mut signals = Signals::new([SIGHUP, SIGTERM, SIGINT, SIGQUIT])?;

    while let Some(signal) = signals.next().await {
        match signal {
            SIGHUP => {
                // Reload configuration
            }
            SIGTERM | SIGINT | SIGQUIT => {
                // Shutdown the system
                info!("Shutting down Bib server v{}...", env!("CARGO_PKG_VERSION"));

                // Stop services
                core.shutdown().await;

                // Wait for services to finish
                tokio::time::sleep(Duration::from_secs(1)).await;

                // Flush DB
                core.store.db.close().failed_to("close database");

                break;
            }
            _ => unreachable!(),
        }
    }

    Ok(())
}

fn spawn_leader_logger<T>(core: Arc<BibServer<T>>)
where
    T: for<'x> Store<'x> + 'static,
{
    let mut events = core.cluster_events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ClusterEvent::LeaderChanged { leader_id } = event {
                match leader_id {
                    Some(leader_id) => info!("Cluster leader is now node {}.", leader_id),
                    None => info!("Cluster has no known leader."),
                }
            }
        }
    });
}
