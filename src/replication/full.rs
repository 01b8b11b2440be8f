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

use super::ReplicationEngine;
use p2p::types::{DiscoveryRequest, DiscoveryResponse};
use store::tracing::{debug, error};
use store::Store;

impl<T> ReplicationEngine<T>
where
    T: for<'x> Store<'x> + 'static,
{
    /// Full mode tracks every topic: enumerate what the connected peers
    /// know, mirror any topic we have not seen, and subscribe to all of
    /// them. The catalog entries themselves arrive through the regular
    /// sync pass.
    pub async fn discover_all_topics(&mut self) {
        let mut peers = match self.handle.connected_peers().await {
            Ok(peers) => peers,
            Err(_) => return,
        };
        self.peer_store.preferred_order(&mut peers);

        let mut discovered = Vec::new();
        for peer in peers {
            let mut page = 0;
            loop {
                match self
                    .handle
                    .request_discovery(peer, DiscoveryRequest::ListTopics { page })
                    .await
                {
                    Ok(DiscoveryResponse::Topics { topics, done, .. }) => {
                        discovered.extend(topics);
                        if done {
                            break;
                        }
                        page += 1;
                    }
                    Ok(_) | Err(_) => break,
                }
            }
        }

        let is_member = self.is_cluster_member();
        let mut changed = false;
        for topic in discovered {
            let topic_id = topic.topic_id;
            if !is_member {
                if let Err(e) = self.mirror_topic(topic) {
                    error!("Failed to mirror topic {}: {}", topic_id, e);
                    continue;
                }
            }
            if self.subscriptions.insert(topic_id) {
                debug!("Now tracking topic {}.", topic_id);
                self.handle
                    .subscribe(p2p::types::topic_for(&topic_id))
                    .await
                    .ok();
                changed = true;
            }
        }

        // Topics created locally through consensus are tracked as well.
        let local_topics = {
            let fsm = self.core.fsm.read();
            fsm.list_topics()
                .iter()
                .map(|topic| topic.topic_id)
                .collect::<Vec<_>>()
        };
        for topic_id in local_topics {
            if self.subscriptions.insert(topic_id) {
                self.handle
                    .subscribe(p2p::types::topic_for(&topic_id))
                    .await
                    .ok();
                changed = true;
            }
        }

        if changed {
            if let Err(e) = self.persist_subscriptions() {
                error!("Failed to persist subscriptions: {}", e);
            }
        }
    }
}
