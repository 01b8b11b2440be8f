use futures::{stream::StreamExt, SinkExt};
use std::net::SocketAddr;
use std::time::Duration;
use store::tracing::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tokio_util::codec::Framed;

use crate::cluster::{Config, Event, NodeId};

use super::serialize::RpcEncoder;
use super::{random_nonce, AuthKey, Frame, Request, Response};

/// Binds the consensus transport and serves inbound connections until
/// shutdown. Every connection must complete the mutual handshake before a
/// single consensus RPC is dispatched.
pub async fn spawn_rpc(
    bind_addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
    main_tx: mpsc::Sender<Event>,
    config: &Config,
    local_node_id: NodeId,
) {
    let listener = TcpListener::bind(bind_addr).await.unwrap_or_else(|e| {
        panic!("Failed to bind RPC listener to {}: {}", bind_addr, e);
    });

    let auth = AuthKey::new(&config.key);
    let rpc_timeout = config.rpc_timeout;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            tokio::spawn(serve_conn(
                                stream,
                                peer_addr,
                                shutdown_rx.clone(),
                                main_tx.clone(),
                                auth.clone(),
                                local_node_id,
                                rpc_timeout,
                            ));
                        }
                        Err(err) => {
                            error!("Failed to accept RPC connection: {}", err);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("RPC listener on {} shutting down.", bind_addr);
                    break;
                }
            }
        }
    });
}

async fn serve_conn(
    stream: TcpStream,
    peer_addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
    main_tx: mpsc::Sender<Event>,
    auth: AuthKey,
    local_node_id: NodeId,
    rpc_timeout: u64,
) {
    if stream.set_nodelay(true).is_err() {
        return;
    }
    let mut frames = Framed::new(stream, RpcEncoder::default());

    // The whole handshake runs under one deadline; a dialer that stalls
    // never ties up the accept path.
    let node_id = match time::timeout(
        Duration::from_millis(rpc_timeout),
        accept_handshake(&mut frames, &auth, local_node_id),
    )
    .await
    {
        Ok(Ok(node_id)) => {
            debug!("Node {} connected from {}.", node_id, peer_addr);
            node_id
        }
        Ok(Err(err)) => {
            debug!("Handshake with {} failed: {}", peer_addr, err);
            return;
        }
        Err(_) => {
            debug!("Handshake with {} timed out.", peer_addr);
            return;
        }
    };

    loop {
        tokio::select! {
            frame = frames.next() => {
                let request = match frame {
                    Some(Ok(Frame::Request(request))) => request,
                    Some(Ok(stray)) => {
                        debug!("Node {} sent a stray frame: {:?}", node_id, stray);
                        return;
                    }
                    Some(Err(err)) => {
                        debug!("Bad frame from node {}: {}", node_id, err);
                        return;
                    }
                    None => {
                        debug!("Node {} hung up.", node_id);
                        return;
                    }
                };
                if !dispatch(&mut frames, &main_tx, node_id, request).await {
                    return;
                }
            }
            _ = shutdown_rx.changed() => {
                debug!("Dropping connection with node {} for shutdown.", node_id);
                return;
            }
        }
    }
}

/// Listener side of the mutual handshake. The dialer introduces itself
/// with a nonce; we prove key possession over that nonce, hand back our
/// own, and expect matching credentials before anything else is served.
async fn accept_handshake(
    frames: &mut Framed<TcpStream, RpcEncoder>,
    auth: &AuthKey,
    local_node_id: NodeId,
) -> std::io::Result<NodeId> {
    let (node_id, dialer_nonce) = match next_request(frames).await? {
        Request::Hello { node_id, nonce } => (node_id, nonce),
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Expected a handshake hello.",
            ));
        }
    };

    let nonce = random_nonce();
    frames
        .send(Frame::Response(Response::Welcome {
            node_id: local_node_id,
            nonce,
            proof: auth.prove(&dialer_nonce, local_node_id),
        }))
        .await?;

    match next_request(frames).await? {
        Request::Credentials { proof } if auth.verify(&nonce, node_id, &proof) => {
            frames.send(Frame::Response(Response::Ready)).await?;
            Ok(node_id)
        }
        Request::Credentials { .. } => Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("Node {} failed cluster key authentication.", node_id),
        )),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Expected handshake credentials.",
        )),
    }
}

/// Routes one authenticated request into the consensus loop and writes the
/// answer back. Returns false when the connection should be dropped.
async fn dispatch(
    frames: &mut Framed<TcpStream, RpcEncoder>,
    main_tx: &mpsc::Sender<Event>,
    node_id: NodeId,
    request: Request,
) -> bool {
    let (response_tx, response_rx) = oneshot::channel();

    if main_tx
        .send(Event::RpcRequest {
            node_id,
            request,
            response_tx,
        })
        .await
        .is_err()
    {
        // The consensus loop is gone; nothing left to serve.
        return false;
    }

    match response_rx.await {
        Ok(response) => match frames.send(Frame::Response(response)).await {
            Ok(()) => true,
            Err(err) => {
                debug!("Failed to answer node {}: {}", node_id, err);
                false
            }
        },
        Err(_) => {
            debug!("Consensus loop dropped a request from node {}.", node_id);
            false
        }
    }
}

async fn next_request(
    frames: &mut Framed<TcpStream, RpcEncoder>,
) -> std::io::Result<Request> {
    match frames.next().await {
        Some(Ok(Frame::Request(request))) => Ok(request),
        Some(Ok(stray)) => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Received a response where a request was due: {:?}", stray),
        )),
        Some(Err(err)) => Err(err),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "Connection closed during handshake.",
        )),
    }
}
