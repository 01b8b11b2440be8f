use crate::{
    cluster::{rpc::listener::spawn_rpc, Cluster, State},
    server::UnwrapFailure,
    BibServer, DEFAULT_RPC_PORT,
};
use catalog::{ClusterMember, MemberRole, MemberState};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::{
    config::env_settings::EnvSettings,
    log::raft::{LogIndex, NodeId, RaftId},
    serialize::key::SystemKey,
    tracing::{debug, error, info},
    Store, Table,
};
use tokio::sync::{mpsc, watch};

use super::commit::fatal_apply_error;
use super::rpc::command::{Command, CommandResponse};
use super::rpc::peer::send_command;
use super::{ClusterIpc, Config, Event, IPC_CHANNEL_BUFFER, RAFT_LOG_BEHIND};

pub struct ClusterInit {
    main_rx: mpsc::Receiver<Event>,
    main_tx: mpsc::Sender<Event>,
    commit_index_tx: watch::Sender<LogIndex>,
}

pub fn init_cluster(settings: &EnvSettings) -> Option<(ClusterIpc, ClusterInit)> {
    if settings.get("cluster-key").is_some() {
        let (main_tx, main_rx) = mpsc::channel::<Event>(IPC_CHANNEL_BUFFER);
        let (commit_index_tx, commit_index_rx) = watch::channel(0);
        (
            ClusterIpc {
                tx: main_tx.clone(),
                state: RAFT_LOG_BEHIND.into(),
                leader_id: None.into(),
                leader_address: None.into(),
                commit_index_rx,
            },
            ClusterInit {
                main_rx,
                main_tx,
                commit_index_tx,
            },
        )
            .into()
    } else {
        None
    }
}

pub async fn start_cluster<T>(
    init: ClusterInit,
    core: Arc<BibServer<T>>,
    settings: &EnvSettings,
) where
    T: for<'x> Store<'x> + 'static,
{
    let main_tx = init.main_tx;
    let mut main_rx = init.main_rx;
    let commit_index_tx = init.commit_index_tx;

    let mut cluster = Cluster::init(settings, core.clone(), main_tx.clone(), commit_index_tx).await;

    let bind_addr = settings.parse_socketaddr(
        "cluster-listen-address",
        &format!("127.0.0.1:{}", DEFAULT_RPC_PORT),
    );
    info!("Starting Raft RPC server at {}...", bind_addr);
    let (shutdown_tx, shutdown_rx) = watch::channel(true);

    spawn_rpc(
        bind_addr,
        shutdown_rx,
        main_tx.clone(),
        &cluster.config,
        cluster.node_id,
    )
    .await;

    // A joiner with a token and no local membership redeems it against the
    // leader before entering the main loop.
    if let Some(token) = settings.get("cluster-join-token") {
        if cluster.peers.is_empty() && !cluster.bootstrap {
            spawn_join_task(&cluster, token);
        }
    }

    let heartbeat_interval = cluster.config.heartbeat_timeout;

    tokio::spawn(async move {
        let mut wait_timeout = Duration::from_millis(heartbeat_interval);
        let mut last_heartbeat = Instant::now();

        #[cfg(test)]
        let mut is_offline = false;

        loop {
            match tokio::time::timeout(wait_timeout, main_rx.recv()).await {
                Ok(Some(message)) => {
                    #[cfg(test)]
                    if let Event::SetOffline {
                        is_offline: set_offline,
                    } = &message
                    {
                        is_offline = *set_offline;
                        debug!(
                            "[{}] Node marked {}.",
                            cluster.addr,
                            if is_offline { "offline" } else { "online" }
                        );
                        cluster.start_election_timer(!is_offline).await;
                    }
                    #[cfg(test)]
                    if is_offline {
                        continue;
                    }

                    match cluster.handle_message(message).await {
                        Ok(true) => (),
                        Ok(false) => {
                            debug!("Cluster shutting down.");
                            shutdown_tx.send(false).ok();
                            break;
                        }
                        Err(err) => {
                            fatal_apply_error(&err);
                        }
                    }
                }
                Ok(None) => {
                    debug!("Cluster main process exiting.");
                    break;
                }
                Err(_) => {
                    #[cfg(test)]
                    if is_offline {
                        continue;
                    }
                }
            }

            // Timer-driven duties: heartbeats when leading, elections when
            // the leader went quiet, snapshots and ack expiry on the side.
            let result = cluster.tick(&mut last_heartbeat, heartbeat_interval).await;
            wait_timeout = match result {
                Ok(wait_timeout) => wait_timeout,
                Err(err) => {
                    fatal_apply_error(&err);
                }
            };
        }
    });
}

impl<T> Cluster<T>
where
    T: for<'x> Store<'x> + 'static,
{
    async fn init(
        settings: &EnvSettings,
        core: Arc<BibServer<T>>,
        tx: mpsc::Sender<Event>,
        commit_index_tx: watch::Sender<LogIndex>,
    ) -> Self {
        let config = Config::new(settings);

        // Obtain or assign this node's id.
        let node_id = if let Some(node_id) = settings.parse::<NodeId>("cluster-node-id") {
            node_id
        } else if let Some(node_id) = core
            .store
            .db
            .get::<u64>(Table::System, SystemKey::NODE_ID)
            .failed_to("read node id")
        {
            node_id
        } else {
            let node_id = store::rand::random::<u64>();
            core.store
                .db
                .set(Table::System, SystemKey::NODE_ID, &node_id.to_be_bytes())
                .failed_to("persist node id");
            node_id
        };

        let addr: SocketAddr = settings.parse_socketaddr(
            "cluster-advertise-address",
            &settings
                .get("cluster-listen-address")
                .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_RPC_PORT)),
        );

        let hard_state = core.store.get_hard_state().failed_to("read hard state");
        let last_log = core
            .store
            .get_last_log_id()
            .failed_to("read log")
            .unwrap_or_else(RaftId::none);
        let last_snapshot = core
            .store
            .snapshots
            .latest()
            .failed_to("read snapshots")
            .map(|meta| meta.last_included)
            .unwrap_or_else(RaftId::none);

        info!(
            "This node is '{}' at {}, log at {}/{}, term {}.",
            node_id, addr, last_log.term, last_log.index, hard_state.current_term
        );

        let mut cluster = Cluster {
            node_id,
            addr,
            is_voter: settings.parse("cluster-is-voter").unwrap_or(true),
            bootstrap: settings.parse("cluster-bootstrap").unwrap_or(false),
            config,
            term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            state: State::Wait {
                election_due: Instant::now(),
            },
            last_log,
            commit_index: core.store.get_applied_index(),
            last_snapshot,
            last_snapshot_time: Instant::now(),
            peers: Vec::new(),
            pending_acks: BTreeMap::new(),
            config_change: None,
            pending_snapshot: None,
            core,
            tx,
            commit_index_tx,
        };
        cluster.state = State::Wait {
            election_due: cluster.election_timeout(false),
        };

        // Honor a vote promised before the restart.
        if let Some(node_id) = hard_state.voted_for {
            if node_id != cluster.node_id {
                cluster.state = State::VotedFor {
                    node_id,
                    election_due: cluster.election_timeout(false),
                };
            }
        }

        // Re-apply entries that committed before the restart.
        if hard_state.commit_index > cluster.commit_index {
            if let Err(err) = cluster.advance_commit(hard_state.commit_index).await {
                error!("Failed to re-apply committed entries: {}", err);
                std::process::exit(1);
            }
        }

        // Connect to the members we already know about.
        cluster.sync_peers_with_membership().await;

        cluster
    }

    /// One timer pass; returns how long the loop may sleep.
    pub async fn tick(
        &mut self,
        last_heartbeat: &mut Instant,
        heartbeat_interval: u64,
    ) -> store::Result<Duration> {
        let mut time_to_next = heartbeat_interval;

        if self.is_leading() {
            let elapsed = last_heartbeat.elapsed().as_millis() as u64;
            if elapsed >= heartbeat_interval {
                self.check_leader_quorum().await?;
                if self.is_leading() {
                    self.send_append_entries().await?;
                }
                *last_heartbeat = Instant::now();
            } else {
                time_to_next = heartbeat_interval - elapsed;
            }
        } else if self.is_election_due() {
            self.request_votes(false).await?;
        } else if let Some(time_to_election) = self.time_to_next_election() {
            time_to_next = std::cmp::min(time_to_next, time_to_election);
        }

        // Probe unreachable members; a ping is the one request that cuts
        // through a connection actor's backoff.
        for peer in &self.peers {
            if !peer.is_online() {
                peer.dispatch_request(super::rpc::Request::Ping).await;
            }
        }

        self.sweep_expired_acks();
        self.maybe_snapshot().await?;

        Ok(Duration::from_millis(std::cmp::max(time_to_next, 10)))
    }
}

impl Config {
    pub fn new(settings: &EnvSettings) -> Self {
        Config {
            key: settings.get("cluster-key").unwrap_or_default(),
            heartbeat_timeout: settings.parse("raft-heartbeat-timeout").unwrap_or(500),
            election_timeout: settings.parse("raft-election-timeout").unwrap_or(1000),
            commit_timeout: settings.parse("raft-commit-timeout").unwrap_or(10 * 1000),
            max_append_entries: settings.parse("raft-max-append-entries").unwrap_or(64),
            max_append_bytes: settings
                .parse("raft-max-append-bytes")
                .unwrap_or(10 * 1024 * 1024),
            trailing_logs: settings.parse("raft-trailing-logs").unwrap_or(256),
            snapshot_interval: settings.parse("snapshot-interval").unwrap_or(3600),
            snapshot_threshold: settings.parse("snapshot-threshold").unwrap_or(8192),
            rpc_timeout: settings.parse("rpc-timeout").unwrap_or(1000),
            rpc_inactivity_timeout: settings
                .parse("rpc-inactivity-timeout")
                .unwrap_or(5 * 60 * 1000),
            rpc_retries_max: settings.parse("rpc-retries-max").unwrap_or(5),
            rpc_backoff_max: settings.parse("rpc-backoff-max").unwrap_or(3 * 60 * 1000),
        }
    }
}

fn spawn_join_task<T>(cluster: &Cluster<T>, token: String)
where
    T: for<'x> Store<'x> + 'static,
{
    let external = match catalog::JoinToken::decode_external(&token) {
        Ok(external) => external,
        Err(e) => {
            error!("Invalid join token: {}", e);
            std::process::exit(1);
        }
    };
    let leader_addr: SocketAddr = match external.leader_address.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(
                "Join token has an unusable leader address '{}': {}",
                external.leader_address, e
            );
            std::process::exit(1);
        }
    };

    let member = ClusterMember {
        node_id: cluster.node_id,
        raft_address: cluster.addr.to_string(),
        peer_id: cluster
            .core
            .p2p
            .as_ref()
            .map(|p2p| p2p.peer_id().to_bytes())
            .unwrap_or_default(),
        role: if cluster.is_voter {
            MemberRole::Voter
        } else {
            MemberRole::NonVoter
        },
        state: MemberState::Joining,
        joined_at: store::chrono::Utc::now().timestamp(),
    };
    let key = cluster.config.key.clone();
    let node_id = cluster.node_id;
    let rpc_timeout = cluster.config.rpc_timeout * 10;

    tokio::spawn(async move {
        let mut backoff = Duration::from_millis(500);
        loop {
            match send_command(
                leader_addr,
                &key,
                node_id,
                Command::Join {
                    token: external.token.clone(),
                    member: member.clone(),
                },
                rpc_timeout,
            )
            .await
            {
                Ok(CommandResponse::JoinAccepted { leader_id, .. }) => {
                    info!("Joined the cluster via leader {}.", leader_id);
                    break;
                }
                Ok(CommandResponse::NotLeader {
                    leader_address: Some(_),
                }) => {
                    // The leader moved; token redemption follows it.
                    debug!("Join target is not the leader, retrying.");
                }
                Ok(CommandResponse::ConfigChangeInFlight) => {
                    debug!("A configuration change is in flight, retrying join.");
                }
                Ok(other) => {
                    error!("Cluster join rejected: {:?}", other);
                    std::process::exit(1);
                }
                Err(e) => {
                    debug!("Join attempt failed: {}, retrying.", e);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, Duration::from_secs(30));
        }
    });
}
