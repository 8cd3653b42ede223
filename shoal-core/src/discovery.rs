// Copyright (c) 2025 Saorsa Labs Limited

// This file is part of the Saorsa P2P network.

// Licensed under the AGPL-3.0 license:
// <https://www.gnu.org/licenses/agpl-3.0.html>

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! LAN peer discovery over UDP broadcast.
//!
//! Nodes broadcast `DISCOVER` when they want peers and answer with a
//! unicast `ANNOUNCE`; everyone also announces periodically. A peer that
//! stays silent past the timeout is dropped. The node consumes discovery
//! events by pinging the advertised DHT endpoint, which folds LAN peers
//! into the routing table through the normal contact path.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// How long a silent peer stays in the table.
const PEER_TIMEOUT: Duration = Duration::from_secs(120);
/// Cadence of periodic announcements.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// A peer seen on the local network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub node_id: String,
    pub ip: IpAddr,
    pub dht_port: u16,
    pub transfer_port: u16,
    #[serde(skip, default = "SystemTime::now")]
    pub last_seen: SystemTime,
}

impl DiscoveredPeer {
    /// The peer's DHT endpoint, the address handed to `ping`.
    pub fn dht_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.dht_port)
    }
}

/// Callback for peer table changes; the flag is true on add, false on
/// expiry.
pub type PeerCallback = Arc<dyn Fn(&DiscoveredPeer, bool) + Send + Sync>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum DiscoveryMessage {
    Discover {
        node_id: String,
        dht_port: u16,
        transfer_port: u16,
    },
    Announce {
        node_id: String,
        dht_port: u16,
        transfer_port: u16,
    },
}

/// UDP broadcast discovery endpoint.
pub struct BroadcastDiscovery {
    node_id: String,
    dht_port: u16,
    transfer_port: u16,
    broadcast_port: u16,
    socket: Arc<UdpSocket>,
    peers: Mutex<HashMap<String, DiscoveredPeer>>,
    callbacks: Mutex<Vec<PeerCallback>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BroadcastDiscovery {
    /// Bind the broadcast socket and start the receive and announce loops.
    pub async fn start(
        node_id: String,
        dht_port: u16,
        transfer_port: u16,
        broadcast_port: u16,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, broadcast_port)).await?;
        socket.set_broadcast(true)?;
        info!(port = broadcast_port, "broadcast discovery started");

        let discovery = Arc::new(Self {
            node_id,
            dht_port,
            transfer_port,
            broadcast_port,
            socket: Arc::new(socket),
            peers: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = discovery.tasks.lock().await;
        let recv = discovery.clone();
        tasks.push(tokio::spawn(async move { recv.recv_loop().await }));
        let announce = discovery.clone();
        tasks.push(tokio::spawn(async move { announce.announce_loop().await }));
        drop(tasks);

        Ok(discovery)
    }

    /// Stop background loops.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("broadcast discovery stopped");
    }

    /// Register a callback for peer add/expiry events.
    pub async fn on_peer_change(&self, callback: PeerCallback) {
        self.callbacks.lock().await.push(callback);
    }

    /// Currently known LAN peers.
    pub async fn peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.lock().await.values().cloned().collect()
    }

    /// DHT endpoints of known peers, for bootstrapping.
    pub async fn bootstrap_candidates(&self) -> Vec<SocketAddr> {
        self.peers
            .lock()
            .await
            .values()
            .map(DiscoveredPeer::dht_addr)
            .collect()
    }

    /// Broadcast a `DISCOVER` and give peers `wait` to answer.
    pub async fn discover(&self, wait: Duration) {
        let message = DiscoveryMessage::Discover {
            node_id: self.node_id.clone(),
            dht_port: self.dht_port,
            transfer_port: self.transfer_port,
        };
        self.broadcast(&message).await;
        tokio::time::sleep(wait).await;
    }

    async fn broadcast(&self, message: &DiscoveryMessage) {
        let Ok(data) = serde_json::to_vec(message) else {
            return;
        };
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.broadcast_port);
        if let Err(err) = self.socket.send_to(&data, target).await {
            debug!(%err, "broadcast send failed");
        }
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 2048];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(%err, "discovery recv error");
                    continue;
                }
            };
            let Ok(message) = serde_json::from_slice::<DiscoveryMessage>(&buf[..len]) else {
                continue;
            };
            match message {
                DiscoveryMessage::Discover {
                    node_id,
                    dht_port,
                    transfer_port,
                } => {
                    if node_id == self.node_id {
                        continue;
                    }
                    self.upsert_peer(node_id, from.ip(), dht_port, transfer_port)
                        .await;
                    // Answer directly so the asker learns about us fast.
                    let reply = DiscoveryMessage::Announce {
                        node_id: self.node_id.clone(),
                        dht_port: self.dht_port,
                        transfer_port: self.transfer_port,
                    };
                    if let Ok(data) = serde_json::to_vec(&reply) {
                        let _ = self.socket.send_to(&data, from).await;
                    }
                }
                DiscoveryMessage::Announce {
                    node_id,
                    dht_port,
                    transfer_port,
                } => {
                    if node_id == self.node_id {
                        continue;
                    }
                    self.upsert_peer(node_id, from.ip(), dht_port, transfer_port)
                        .await;
                }
            }
        }
    }

    async fn upsert_peer(&self, node_id: String, ip: IpAddr, dht_port: u16, transfer_port: u16) {
        let peer = DiscoveredPeer {
            node_id: node_id.clone(),
            ip,
            dht_port,
            transfer_port,
            last_seen: SystemTime::now(),
        };
        let is_new = {
            let mut peers = self.peers.lock().await;
            peers.insert(node_id, peer.clone()).is_none()
        };
        if is_new {
            debug!(peer = %peer.node_id, %ip, "discovered LAN peer");
            for callback in self.callbacks.lock().await.iter() {
                callback(&peer, true);
            }
        }
    }

    async fn announce_loop(self: Arc<Self>) {
        loop {
            let message = DiscoveryMessage::Announce {
                node_id: self.node_id.clone(),
                dht_port: self.dht_port,
                transfer_port: self.transfer_port,
            };
            self.broadcast(&message).await;
            self.expire_peers().await;
            tokio::time::sleep(ANNOUNCE_INTERVAL).await;
        }
    }

    async fn expire_peers(&self) {
        let mut expired = Vec::new();
        {
            let mut peers = self.peers.lock().await;
            peers.retain(|_, peer| {
                let alive = peer
                    .last_seen
                    .elapsed()
                    .map(|age| age < PEER_TIMEOUT)
                    .unwrap_or(false);
                if !alive {
                    expired.push(peer.clone());
                }
                alive
            });
        }
        for peer in expired {
            debug!(peer = %peer.node_id, "LAN peer expired");
            for callback in self.callbacks.lock().await.iter() {
                callback(&peer, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_messages_round_trip() {
        let msg = DiscoveryMessage::Announce {
            node_id: "abc".into(),
            dht_port: 8468,
            transfer_port: 8469,
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"ANNOUNCE\""));
        let back: DiscoveryMessage = serde_json::from_str(&json).expect("parse");
        match back {
            DiscoveryMessage::Announce {
                node_id, dht_port, ..
            } => {
                assert_eq!(node_id, "abc");
                assert_eq!(dht_port, 8468);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_discovery_message_is_ignored() {
        let parsed = serde_json::from_str::<DiscoveryMessage>(r#"{"type":"GOODBYE"}"#);
        assert!(parsed.is_err());
    }
}
