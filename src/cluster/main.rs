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

use super::{rpc, Cluster, Event};
use store::tracing::{debug, error};
use store::Store;
use tokio::sync::oneshot;

impl<T> Cluster<T>
where
    T: for<'x> Store<'x> + 'static,
{
    pub async fn handle_message(&mut self, message: Event) -> store::Result<bool> {
        match message {
            Event::RpcRequest {
                node_id,
                request,
                response_tx,
            } => match request {
                rpc::Request::Vote { term, last } => {
                    self.handle_vote_request(node_id, response_tx, term, last)
                        .await?;
                }
                rpc::Request::AppendEntries { term, request } => {
                    self.handle_append_entries(node_id, response_tx, term, request)
                        .await?;
                }
                rpc::Request::InstallSnapshot { term, request } => {
                    self.handle_install_snapshot(node_id, response_tx, term, request)
                        .await?;
                }
                rpc::Request::Command { command } => {
                    // Bridge the typed command response back into the RPC
                    // stream.
                    let (command_tx, command_rx) = oneshot::channel();
                    tokio::spawn(async move {
                        let response = match command_rx.await {
                            Ok(response) => rpc::Response::Command { response },
                            Err(_) => rpc::Response::Unavailable,
                        };
                        response_tx.send(response).ok();
                    });
                    self.handle_command(command, command_tx).await?;
                }
                rpc::Request::Ping => response_tx
                    .send(rpc::Response::Pong)
                    .unwrap_or_else(|_| error!("Oneshot response channel closed.")),
                _ => response_tx
                    .send(rpc::Response::Unavailable)
                    .unwrap_or_else(|_| error!("Oneshot response channel closed.")),
            },
            Event::RpcResponse { node_id, response } => match response {
                rpc::Response::Vote { term, vote_granted } => {
                    self.handle_vote_response(node_id, term, vote_granted)
                        .await?;
                }
                rpc::Response::AppendEntries(response) => {
                    self.handle_append_entries_response(node_id, response)
                        .await?;
                }
                rpc::Response::InstallSnapshot(response) => {
                    self.handle_install_snapshot_response(node_id, response)
                        .await?;
                }
                rpc::Response::StepDown { term } => {
                    if term > self.term {
                        self.step_down(term).await?;
                    }
                }
                rpc::Response::UnregisteredPeer => {
                    debug!(
                        "[{}] Node {} does not know us as a member yet.",
                        self.addr, node_id
                    );
                }
                _ => (),
            },
            Event::RpcCommand {
                command,
                response_tx,
            } => {
                self.handle_command(command, response_tx).await?;
            }
            Event::StepDown { term } => {
                if term > self.term {
                    self.step_down(term).await?;
                } else {
                    self.start_election_timer(false).await;
                }
            }
            Event::Shutdown => return Ok(false),

            #[cfg(test)]
            Event::SetOffline { .. } => (),
        }
        Ok(true)
    }
}
