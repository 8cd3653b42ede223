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


//! The Kademlia engine.
//!
//! Drives iterative alpha-parallel lookups, value storage, peer
//! announcements and the maintenance loop on top of the routing table and
//! UDP transport. Lookups are iterative: we query each hop ourselves, which
//! keeps control local and feeds every response back into the routing
//! table.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::protocol::{Message, MessageBody, NodeEntry, PeerEntry};
use super::routing::{NodeContact, RoutingStats, RoutingTable};
use super::transport::{DhtTransport, MAX_DATAGRAM};
use super::{DhtConfig, NodeId};
use crate::error::{Error, Result};

/// A value held in local DHT storage.
#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    stored_at: Instant,
}

/// What an iterative lookup is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupKind {
    Node,
    Value,
    Peers,
}

/// Everything a lookup round can learn from one contact.
#[derive(Debug, Default)]
struct QueryReply {
    nodes: Vec<NodeEntry>,
    value: Option<String>,
    peers: Vec<PeerEntry>,
}

/// Result of a full iterative lookup.
#[derive(Debug, Default)]
struct LookupOutcome {
    closest: Vec<NodeContact>,
    value: Option<String>,
    peers: HashSet<PeerEntry>,
}

/// Node statistics, shaped for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtStats {
    pub node_id: String,
    pub stored_values: usize,
    pub tracked_files: usize,
    pub bootstrapped: bool,
    pub routing: RoutingStats,
}

/// A Kademlia DHT node: routing table, local storage, peer records and the
/// background tasks that keep them fresh.
pub struct KademliaNode {
    /// Back-reference for handing clones to spawned tasks.
    weak: Weak<KademliaNode>,
    local_id: NodeId,
    config: DhtConfig,
    routing: Arc<RoutingTable>,
    transport: Arc<DhtTransport>,
    storage: Mutex<HashMap<NodeId, StoredValue>>,
    /// info_hash -> transfer endpoint -> announce time.
    peers: Mutex<HashMap<NodeId, HashMap<PeerEntry, SystemTime>>>,
    /// Contacts currently being liveness-probed, to avoid duplicate probes.
    probing: Mutex<HashSet<NodeId>>,
    bootstrapped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KademliaNode {
    /// Bind the UDP endpoint and assemble an engine. Call
    /// [`KademliaNode::start`] to begin serving.
    pub async fn bind(local_id: NodeId, addr: SocketAddr, config: DhtConfig) -> Result<Arc<Self>> {
        let transport = Arc::new(DhtTransport::bind(addr).await?);
        let routing = Arc::new(RoutingTable::new(local_id, config.k));
        info!(id = %local_id.short(), addr = %transport.local_addr(), "kademlia node bound");
        Ok(Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            local_id,
            config,
            routing,
            transport,
            storage: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            probing: Mutex::new(HashSet::new()),
            bootstrapped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    fn strong(&self) -> Arc<Self> {
        self.weak.upgrade().expect("self is alive while borrowed")
    }

    /// Spawn the receive loop, the pending-request sweep and the
    /// maintenance loop.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;

        let node = self.strong();
        tasks.push(tokio::spawn(async move { node.recv_loop().await }));

        let node = self.strong();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(node.config.sweep_interval).await;
                node.transport
                    .expire_pending(node.config.request_timeout)
                    .await;
            }
        }));

        let node = self.strong();
        tasks.push(tokio::spawn(async move { node.maintenance_loop().await }));
    }

    /// Stop background tasks and fail every pending request with
    /// `Cancelled`.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.transport.cancel_pending().await;
        info!(id = %self.local_id.short(), "kademlia node stopped");
    }

    /// Our node id.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Address of the bound UDP endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// The routing table, for diagnostics and tests.
    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// Whether bootstrap has completed.
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Relaxed)
    }

    // === Public DHT operations ===

    /// Join the network: ping the seeds, look up our own id, then run one
    /// refresh pass. Returns the number of seeds that answered.
    #[instrument(skip(self, seeds), fields(id = %self.local_id.short()))]
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<usize> {
        if seeds.is_empty() {
            warn!("no bootstrap seeds, running as first node");
            return Ok(0);
        }

        let results = join_all(seeds.iter().map(|addr| self.ping(*addr))).await;
        let responded = results.iter().filter(|ok| **ok).count();
        info!(responded, total = seeds.len(), "bootstrap pings");
        if responded == 0 {
            warn!("no bootstrap seed responded");
            return Ok(0);
        }

        let _ = self.find_node(self.local_id).await;
        self.refresh_buckets().await;
        self.bootstrapped.store(true, Ordering::Relaxed);

        let stats = self.routing.stats().await;
        info!(nodes = stats.total_nodes, "bootstrap complete");
        Ok(responded)
    }

    /// Ping an address; a pong adds the responder to the routing table.
    pub async fn ping(&self, addr: SocketAddr) -> bool {
        let request = Message::request(self.local_id, MessageBody::Ping {});
        match self
            .transport
            .send_request(request, addr, self.config.request_timeout)
            .await
        {
            Ok(response) if matches!(response.body, MessageBody::Pong {}) => {
                self.offer_contact(NodeContact::new(
                    response.sender_id,
                    addr.ip(),
                    addr.port(),
                ))
                .await;
                true
            }
            _ => false,
        }
    }

    /// Find the K closest nodes to `target`.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<NodeContact>> {
        let outcome = self.iterative_lookup(target, LookupKind::Node).await;
        Ok(outcome.closest)
    }

    /// Find a value: local storage first, then the network.
    pub async fn find_value(&self, key: NodeId) -> Result<Option<String>> {
        if let Some(stored) = self.storage.lock().await.get(&key) {
            return Ok(Some(stored.value.clone()));
        }
        let outcome = self.iterative_lookup(key, LookupKind::Value).await;
        Ok(outcome.value)
    }

    /// Store a value on the K closest nodes and locally.
    ///
    /// Best effort: succeeds when at least one remote accepted, or when we
    /// know no other nodes yet.
    #[instrument(skip(self, value), fields(key = %key.short(), len = value.len()))]
    pub async fn store(&self, key: NodeId, value: String) -> Result<bool> {
        if value.len() > self.config.max_value_size {
            return Err(Error::InvalidMessage(format!(
                "value of {} bytes exceeds the {} byte store limit",
                value.len(),
                self.config.max_value_size
            )));
        }

        let (attempted, succeeded) = self.store_remote(key, &value).await;
        self.storage.lock().await.insert(
            key,
            StoredValue {
                value,
                stored_at: Instant::now(),
            },
        );
        debug!(attempted, succeeded, "store fan-out finished");
        Ok(attempted == 0 || succeeded > 0)
    }

    /// Announce that we serve `info_hash` on `transfer_port`. Returns how
    /// many nodes accepted the announcement.
    #[instrument(skip(self), fields(key = %info_hash.short()))]
    pub async fn announce_peer(&self, info_hash: NodeId, transfer_port: u16) -> Result<usize> {
        let closest = self.find_node(info_hash).await?;

        let local_entry = PeerEntry {
            ip: self.transport.local_addr().ip(),
            port: transfer_port,
        };
        self.peers
            .lock()
            .await
            .entry(info_hash)
            .or_default()
            .insert(local_entry, SystemTime::now());

        if closest.is_empty() {
            return Ok(0);
        }

        let results = join_all(closest.iter().map(|contact| async move {
            let request = Message::request(
                self.local_id,
                MessageBody::AnnouncePeer {
                    info_hash,
                    port: transfer_port,
                },
            );
            matches!(
                self.transport
                    .send_request(request, contact.addr(), self.config.request_timeout)
                    .await,
                Ok(Message {
                    body: MessageBody::AnnounceResponse { success: true },
                    ..
                })
            )
        }))
        .await;

        let accepted = results.into_iter().filter(|ok| *ok).count();
        info!(accepted, of = closest.len(), "announced file");
        Ok(accepted)
    }

    /// Find transfer endpoints of peers serving `info_hash`.
    pub async fn get_peers(&self, info_hash: NodeId) -> Result<Vec<SocketAddr>> {
        let mut found: HashSet<PeerEntry> = self
            .peers
            .lock()
            .await
            .get(&info_hash)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();

        let outcome = self.iterative_lookup(info_hash, LookupKind::Peers).await;
        found.extend(outcome.peers);

        let mut addrs: Vec<SocketAddr> = found
            .into_iter()
            .map(|entry| SocketAddr::new(entry.ip, entry.port))
            .collect();
        addrs.sort();
        Ok(addrs)
    }

    /// Engine statistics.
    pub async fn stats(&self) -> DhtStats {
        DhtStats {
            node_id: self.local_id.to_hex(),
            stored_values: self.storage.lock().await.len(),
            tracked_files: self.peers.lock().await.len(),
            bootstrapped: self.is_bootstrapped(),
            routing: self.routing.stats().await,
        }
    }

    // === Iterative lookup ===

    #[instrument(skip(self), fields(target = %target.short(), ?kind))]
    async fn iterative_lookup(&self, target: NodeId, kind: LookupKind) -> LookupOutcome {
        let mut outcome = LookupOutcome::default();

        let seeds = self.routing.closest(&target, self.config.k).await;
        if seeds.is_empty() {
            return outcome;
        }

        let mut seen: HashMap<NodeId, NodeContact> =
            seeds.into_iter().map(|c| (c.node_id, c)).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();

        loop {
            let mut candidates: Vec<NodeContact> = seen.values().cloned().collect();
            candidates.sort_by(|a, b| {
                target
                    .distance(&a.node_id)
                    .cmp(&target.distance(&b.node_id))
                    .then_with(|| a.node_id.cmp(&b.node_id))
            });

            // Done once the K closest we know of have all been asked.
            if candidates
                .iter()
                .take(self.config.k)
                .all(|c| queried.contains(&c.node_id))
            {
                break;
            }

            let batch: Vec<NodeContact> = candidates
                .into_iter()
                .filter(|c| !queried.contains(&c.node_id))
                .take(self.config.alpha)
                .collect();
            if batch.is_empty() {
                break;
            }

            let replies = join_all(batch.iter().map(|contact| async move {
                self.query_contact(contact, target, kind).await
            }))
            .await;

            for (contact, reply) in batch.into_iter().zip(replies) {
                queried.insert(contact.node_id);
                match reply {
                    Ok(reply) => {
                        self.routing.mark_seen(&contact.node_id).await;
                        if reply.value.is_some() {
                            outcome.value = reply.value;
                        }
                        outcome.peers.extend(reply.peers);
                        for entry in reply.nodes {
                            if entry.node_id == self.local_id {
                                continue;
                            }
                            let discovered: NodeContact = entry.into();
                            self.offer_contact(discovered.clone()).await;
                            seen.entry(discovered.node_id).or_insert(discovered);
                        }
                    }
                    Err(err) => {
                        debug!(peer = %contact.node_id.short(), %err, "lookup query failed");
                        self.routing.remove(&contact.node_id).await;
                        seen.remove(&contact.node_id);
                    }
                }
            }

            if kind == LookupKind::Value && outcome.value.is_some() {
                break;
            }
        }

        let mut closest: Vec<NodeContact> = seen.into_values().collect();
        closest.sort_by(|a, b| {
            target
                .distance(&a.node_id)
                .cmp(&target.distance(&b.node_id))
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        closest.truncate(self.config.k);
        outcome.closest = closest;
        outcome
    }

    async fn query_contact(
        &self,
        contact: &NodeContact,
        target: NodeId,
        kind: LookupKind,
    ) -> Result<QueryReply> {
        let body = match kind {
            LookupKind::Node => MessageBody::FindNode { target_id: target },
            LookupKind::Value => MessageBody::FindValue { key: target },
            LookupKind::Peers => MessageBody::GetPeers { info_hash: target },
        };
        let request = Message::request(self.local_id, body);
        let response = self
            .transport
            .send_request(request, contact.addr(), self.config.request_timeout)
            .await?;

        match response.body {
            MessageBody::FindNodeResponse { nodes } if kind == LookupKind::Node => Ok(QueryReply {
                nodes,
                ..QueryReply::default()
            }),
            MessageBody::FindValueResponse { value, nodes } if kind == LookupKind::Value => {
                Ok(QueryReply {
                    nodes,
                    value,
                    ..QueryReply::default()
                })
            }
            MessageBody::GetPeersResponse { peers, nodes } if kind == LookupKind::Peers => {
                Ok(QueryReply {
                    nodes,
                    peers,
                    ..QueryReply::default()
                })
            }
            other => Err(Error::InvalidMessage(format!(
                "unexpected {} reply to {:?} query",
                other.kind(),
                kind
            ))),
        }
    }

    /// Fan STORE out to the K closest nodes. Returns (attempted, succeeded).
    async fn store_remote(&self, key: NodeId, value: &str) -> (usize, usize) {
        let closest = match self.find_node(key).await {
            Ok(contacts) => contacts,
            Err(_) => Vec::new(),
        };
        if closest.is_empty() {
            return (0, 0);
        }

        let results = join_all(closest.iter().map(|contact| async move {
            let request = Message::request(
                self.local_id,
                MessageBody::Store {
                    key,
                    value: value.to_string(),
                },
            );
            matches!(
                self.transport
                    .send_request(request, contact.addr(), self.config.request_timeout)
                    .await,
                Ok(Message {
                    body: MessageBody::StoreResponse { success: true },
                    ..
                })
            )
        }))
        .await;

        let succeeded = results.into_iter().filter(|ok| *ok).count();
        (closest.len(), succeeded)
    }

    // === Routing table upkeep ===

    /// Offer a contact to the routing table. When the target bucket is full
    /// the oldest contact gets probed in the background; only a dead old
    /// contact is replaced (by the oldest replacement-cache entry).
    fn offer_contact(
        &self,
        contact: NodeContact,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if contact.node_id == self.local_id {
                return;
            }
            if let Some(oldest) = self.routing.insert(contact).await {
                {
                    let mut probing = self.probing.lock().await;
                    if !probing.insert(oldest.node_id) {
                        return;
                    }
                }
                let node = self.strong();
                tokio::spawn(async move {
                    let alive = node.ping(oldest.addr()).await;
                    if !alive {
                        debug!(peer = %oldest.node_id.short(), "oldest contact dead, evicting");
                        node.routing.remove(&oldest.node_id).await;
                    }
                    node.probing.lock().await.remove(&oldest.node_id);
                });
            }
        })
    }

    // === Incoming messages ===

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match self.transport.recv(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    debug!(%err, "recv error");
                    continue;
                }
            };
            let message = match Message::decode(&buf[..len]) {
                Ok(message) => message,
                Err(err) => {
                    debug!(%from, %err, "dropping malformed datagram");
                    continue;
                }
            };
            if let Some(request) = self.transport.route_response(message).await {
                let node = self.clone();
                tokio::spawn(async move { node.handle_request(request, from).await });
            }
        }
    }

    async fn handle_request(&self, message: Message, from: SocketAddr) {
        // Every message teaches us about its sender.
        self.offer_contact(NodeContact::new(message.sender_id, from.ip(), from.port()))
            .await;

        let reply = match message.body {
            MessageBody::Ping {} => Some(MessageBody::Pong {}),

            MessageBody::FindNode { target_id } => Some(MessageBody::FindNodeResponse {
                nodes: self.closest_entries(&target_id).await,
            }),

            MessageBody::FindValue { key } => {
                let stored = self.storage.lock().await.get(&key).map(|s| s.value.clone());
                match stored {
                    Some(value) => Some(MessageBody::FindValueResponse {
                        value: Some(value),
                        nodes: Vec::new(),
                    }),
                    None => Some(MessageBody::FindValueResponse {
                        value: None,
                        nodes: self.closest_entries(&key).await,
                    }),
                }
            }

            MessageBody::Store { key, value } => {
                let success = value.len() <= self.config.max_value_size;
                if success {
                    self.storage.lock().await.insert(
                        key,
                        StoredValue {
                            value,
                            stored_at: Instant::now(),
                        },
                    );
                } else {
                    warn!(key = %key.short(), "rejecting oversize store");
                }
                Some(MessageBody::StoreResponse { success })
            }

            MessageBody::AnnouncePeer { info_hash, port } => {
                // The datagram's source IP is authoritative; the payload
                // only names the transfer port.
                let entry = PeerEntry {
                    ip: from.ip(),
                    port,
                };
                self.peers
                    .lock()
                    .await
                    .entry(info_hash)
                    .or_default()
                    .insert(entry, SystemTime::now());
                Some(MessageBody::AnnounceResponse { success: true })
            }

            MessageBody::GetPeers { info_hash } => {
                let known: Vec<PeerEntry> = self
                    .peers
                    .lock()
                    .await
                    .get(&info_hash)
                    .map(|entries| entries.keys().cloned().collect())
                    .unwrap_or_default();
                if known.is_empty() {
                    Some(MessageBody::GetPeersResponse {
                        peers: Vec::new(),
                        nodes: self.closest_entries(&info_hash).await,
                    })
                } else {
                    Some(MessageBody::GetPeersResponse {
                        peers: known,
                        nodes: Vec::new(),
                    })
                }
            }

            // Response types arriving outside the pending map carry no work.
            _ => None,
        };

        if let Some(body) = reply {
            let response = Message::response(self.local_id, message.message_id, body);
            if let Err(err) = self.transport.send(&response, from).await {
                debug!(%from, %err, "failed to send response");
            }
        }
    }

    async fn closest_entries(&self, target: &NodeId) -> Vec<NodeEntry> {
        self.routing
            .closest(target, self.config.k)
            .await
            .iter()
            .map(NodeEntry::from)
            .collect()
    }

    // === Maintenance ===

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.is_bootstrapped() {
                continue;
            }
            self.refresh_buckets().await;
            self.republish().await;
            self.expire_peers().await;
        }
    }

    /// Look up random targets in empty buckets to discover nodes in sparse
    /// regions of the id space. Bounded per cycle by `refresh_per_cycle`.
    async fn refresh_buckets(&self) {
        let targets = self.routing.refresh_targets().await;
        for target in targets.into_iter().take(self.config.refresh_per_cycle) {
            let _ = self.find_node(target).await;
        }
    }

    /// Re-store locally owned values older than the republish interval. The
    /// store time is re-anchored on success so a hot key republishes at most
    /// once per interval.
    async fn republish(&self) {
        let due: Vec<(NodeId, String)> = {
            let storage = self.storage.lock().await;
            storage
                .iter()
                .filter(|(_, stored)| stored.stored_at.elapsed() > self.config.republish_after)
                .map(|(key, stored)| (*key, stored.value.clone()))
                .collect()
        };
        for (key, value) in due {
            let (attempted, succeeded) = self.store_remote(key, &value).await;
            if attempted == 0 || succeeded > 0 {
                if let Some(stored) = self.storage.lock().await.get_mut(&key) {
                    stored.stored_at = Instant::now();
                }
                debug!(key = %key.short(), succeeded, "republished value");
            }
        }
    }

    /// Drop peer announcements older than the expiry window.
    async fn expire_peers(&self) {
        let expiry = self.config.peer_expiry;
        let mut peers = self.peers.lock().await;
        peers.retain(|_, entries| {
            entries.retain(|_, announced| {
                announced
                    .elapsed()
                    .map(|age| age < expiry)
                    .unwrap_or(false)
            });
            !entries.is_empty()
        });
    }
}
