use futures::{stream::StreamExt, SinkExt};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use store::rand::Rng;
use store::tracing::{debug, error};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_util::codec::Framed;

use crate::cluster::{Config, Event, NodeId, IPC_CHANNEL_BUFFER};

use super::serialize::RpcEncoder;
use super::{random_nonce, AuthKey, Frame, Request, Response, RpcEvent};

type Connection = Framed<TcpStream, RpcEncoder>;

/// Spawns the connection actor for one cluster member. The actor owns the
/// socket; the rest of the node only ever sees the returned queue and the
/// reachability watch.
pub fn spawn_peer_rpc(
    main_tx: mpsc::Sender<Event>,
    local_node_id: NodeId,
    config: &Config,
    node_id: NodeId,
    peer_addr: SocketAddr,
) -> (mpsc::Sender<RpcEvent>, watch::Receiver<bool>) {
    let (event_tx, event_rx) = mpsc::channel::<RpcEvent>(IPC_CHANNEL_BUFFER);
    let (online_tx, online_rx) = watch::channel(false);

    let actor = PeerConnection {
        node_id,
        local_node_id,
        peer_addr,
        auth: AuthKey::new(&config.key),
        rpc_timeout: config.rpc_timeout,
        idle_timeout: config.rpc_inactivity_timeout,
        failure_threshold: config.rpc_retries_max,
        backoff_max: config.rpc_backoff_max,
        conn: None,
        failures: 0,
        retry_at: None,
        main_tx,
        online_tx,
    };
    tokio::spawn(actor.run(event_rx));

    (event_tx, online_rx)
}

/// One actor per remote member. Delivery is fail-fast: a request that
/// cannot be sent is answered immediately (the consensus loop retries on
/// its own cadence), and after enough consecutive failures the actor backs
/// off instead of hammering a dead address. Heartbeats cut the backoff
/// short, so a peer that comes back is picked up within one ping interval.
struct PeerConnection {
    node_id: NodeId,
    local_node_id: NodeId,
    peer_addr: SocketAddr,
    auth: AuthKey,

    rpc_timeout: u64,
    idle_timeout: u64,
    failure_threshold: u32,
    backoff_max: u64,

    conn: Option<Connection>,
    failures: u32,
    retry_at: Option<Instant>,

    main_tx: mpsc::Sender<Event>,
    online_tx: watch::Sender<bool>,
}

impl PeerConnection {
    async fn run(mut self, mut event_rx: mpsc::Receiver<RpcEvent>) {
        loop {
            match time::timeout(Duration::from_millis(self.idle_timeout), event_rx.recv()).await
            {
                Ok(Some(event)) => self.deliver(event).await,
                Ok(None) => {
                    // The member was removed from the cluster.
                    break;
                }
                Err(_) => {
                    if self.conn.take().is_some() {
                        debug!("Hanging up idle connection to node {}.", self.node_id);
                    }
                }
            }
        }
        debug!("Connection actor for node {} stopped.", self.node_id);
    }

    async fn deliver(&mut self, event: RpcEvent) {
        // While backing off, only a heartbeat may force a fresh dial.
        if let Some(retry_at) = self.retry_at {
            let is_ping = matches!(
                &event,
                RpcEvent::Notify {
                    request: Request::Ping
                }
            );
            if !is_ping && Instant::now() < retry_at {
                event.undeliverable();
                return;
            }
            self.retry_at = None;
        }

        let (request, response_tx) = match event {
            RpcEvent::Notify { request } => (request, None),
            RpcEvent::Call {
                request,
                response_tx,
            } => (request, Some(response_tx)),
        };

        match self.exchange(request).await {
            Ok(response) => {
                self.failures = 0;
                match response_tx {
                    Some(response_tx) => {
                        response_tx.send(response).ok();
                    }
                    None => {
                        if let Err(err) = self
                            .main_tx
                            .send(Event::RpcResponse {
                                node_id: self.node_id,
                                response,
                            })
                            .await
                        {
                            error!("Cluster event channel failed: {}", err);
                        }
                    }
                }
            }
            Err(err) => {
                debug!("RPC to node {} failed: {}", self.node_id, err);
                self.conn = None;
                self.online_tx.send(false).ok();

                self.failures += 1;
                if self.failures >= self.failure_threshold {
                    // Truncated exponential backoff with jitter.
                    let backoff = std::cmp::min(
                        250u64.saturating_mul(1u64 << self.failures.min(16))
                            + store::rand::thread_rng().gen_range(0..250),
                        self.backoff_max,
                    );
                    self.retry_at = Some(Instant::now() + Duration::from_millis(backoff));
                }

                if let Some(response_tx) = response_tx {
                    response_tx.send(Response::Unavailable).ok();
                }
            }
        }
    }

    /// Sends one request over the live connection, dialing and
    /// authenticating first when there is none. The whole round trip runs
    /// under the RPC deadline.
    async fn exchange(&mut self, request: Request) -> io::Result<Response> {
        if self.conn.is_none() {
            let (conn, _) = establish(
                self.peer_addr,
                &self.auth,
                self.local_node_id,
                Some(self.node_id),
                self.rpc_timeout,
            )
            .await?;
            self.conn = Some(conn);
            self.online_tx.send(true).ok();
        }
        let conn = self.conn.as_mut().unwrap();

        time::timeout(Duration::from_millis(self.rpc_timeout), async {
            conn.send(Frame::Request(request)).await?;
            next_response(conn).await
        })
        .await
        .map_err(|_| deadline_error(self.peer_addr))?
    }
}

/// Dials `addr` and runs the mutual handshake: we introduce ourselves with
/// a nonce, the listener proves key possession over it, then we prove
/// ourselves over the listener's nonce. Returns the authenticated remote
/// node id; pass `expected` to refuse an address that answers as somebody
/// else.
pub async fn establish(
    addr: SocketAddr,
    auth: &AuthKey,
    local_node_id: NodeId,
    expected: Option<NodeId>,
    timeout_ms: u64,
) -> io::Result<(Connection, NodeId)> {
    time::timeout(Duration::from_millis(timeout_ms), async {
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        let mut conn = Framed::new(stream, RpcEncoder::default());

        let nonce = random_nonce();
        conn.send(Frame::Request(Request::Hello {
            node_id: local_node_id,
            nonce,
        }))
        .await?;

        let remote_node_id = match next_response(&mut conn).await? {
            Response::Welcome {
                node_id,
                nonce: remote_nonce,
                proof,
            } => {
                if !auth.verify(&nonce, node_id, &proof) {
                    return Err(protocol_error(
                        "Listener failed cluster key authentication.",
                    ));
                }
                if expected.is_some_and(|expected| expected != node_id) {
                    return Err(protocol_error("Listener answered with a foreign node id."));
                }
                conn.send(Frame::Request(Request::Credentials {
                    proof: auth.prove(&remote_nonce, local_node_id),
                }))
                .await?;
                node_id
            }
            _ => return Err(protocol_error("Expected a handshake welcome.")),
        };

        match next_response(&mut conn).await? {
            Response::Ready => Ok((conn, remote_node_id)),
            _ => Err(protocol_error("Listener rejected our credentials.")),
        }
    })
    .await
    .map_err(|_| deadline_error(addr))?
}

/// One-shot client used by prospective joiners that are not members yet:
/// authenticate, send a single command, return its response.
pub async fn send_command(
    addr: SocketAddr,
    auth_key: &str,
    node_id: NodeId,
    command: super::command::Command,
    rpc_timeout: u64,
) -> io::Result<super::command::CommandResponse> {
    let auth = AuthKey::new(auth_key);
    let (mut conn, _) = establish(addr, &auth, node_id, None, rpc_timeout).await?;

    conn.send(Frame::Request(Request::Command { command })).await?;
    match next_response(&mut conn).await? {
        Response::Command { response } => Ok(response),
        invalid => Err(protocol_error(&format!(
            "Unexpected command response: {:?}",
            invalid
        ))),
    }
}

async fn next_response(conn: &mut Connection) -> io::Result<Response> {
    match conn.next().await {
        Some(Ok(Frame::Response(response))) => Ok(response),
        Some(Ok(invalid)) => Err(protocol_error(&format!(
            "Received a request where a response was due: {:?}",
            invalid
        ))),
        Some(Err(err)) => Err(err),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Connection closed mid-exchange.",
        )),
    }
}

fn protocol_error(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}

fn deadline_error(addr: SocketAddr) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("RPC deadline to {} expired.", addr),
    )
}
