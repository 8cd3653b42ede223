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


//! Kademlia routing table.
//!
//! 160 k-buckets, each holding up to K contacts ordered oldest to newest,
//! with a bounded FIFO replacement cache per bucket. New contacts never
//! evict a live old one: a full bucket parks the newcomer in the
//! replacement cache and hands the caller the oldest contact for a liveness
//! probe. Only when that probe fails is the old contact dropped and the
//! oldest cached replacement promoted.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Distance, ID_BITS, NodeId};

/// A known node in the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeContact {
    /// The node's id.
    pub node_id: NodeId,
    /// Address the node's DHT endpoint was last seen at.
    pub ip: IpAddr,
    /// UDP port of the node's DHT endpoint.
    pub port: u16,
    /// When we last heard from this node.
    #[serde(skip, default = "SystemTime::now")]
    pub last_seen: SystemTime,
    /// Consecutive failed requests.
    #[serde(skip)]
    pub failed_requests: u32,
}

impl NodeContact {
    /// Create a contact that was observed just now.
    pub fn new(node_id: NodeId, ip: IpAddr, port: u16) -> Self {
        Self {
            node_id,
            ip,
            port,
            last_seen: SystemTime::now(),
            failed_requests: 0,
        }
    }

    /// Socket address of the node's DHT endpoint.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// One k-bucket: main list plus replacement cache, both capped at `k`.
#[derive(Debug)]
struct KBucket {
    k: usize,
    /// Contacts, oldest at the front.
    entries: VecDeque<NodeContact>,
    /// FIFO cache of candidates waiting for a slot.
    replacements: VecDeque<NodeContact>,
}

impl KBucket {
    fn new(k: usize) -> Self {
        Self {
            k,
            entries: VecDeque::new(),
            replacements: VecDeque::new(),
        }
    }

    /// Insert or refresh a contact.
    ///
    /// Returns the bucket's oldest contact when the bucket is full and the
    /// newcomer was parked in the replacement cache; the caller should probe
    /// that contact and call [`KBucket::remove`] if it fails to respond.
    fn upsert(&mut self, contact: NodeContact) -> Option<NodeContact> {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|c| c.node_id == contact.node_id)
        {
            let mut existing = self.entries.remove(pos).expect("position is valid");
            existing.ip = contact.ip;
            existing.port = contact.port;
            existing.last_seen = SystemTime::now();
            existing.failed_requests = 0;
            self.entries.push_back(existing);
            return None;
        }

        if self.entries.len() < self.k {
            self.entries.push_back(contact);
            return None;
        }

        // Full bucket: remember the newcomer, keep the cache bounded.
        if let Some(pos) = self
            .replacements
            .iter()
            .position(|c| c.node_id == contact.node_id)
        {
            self.replacements.remove(pos);
        }
        self.replacements.push_back(contact);
        while self.replacements.len() > self.k {
            self.replacements.pop_front();
        }

        self.entries.front().cloned()
    }

    /// Drop a contact, promoting the oldest replacement if one exists.
    fn remove(&mut self, node_id: &NodeId) -> bool {
        let Some(pos) = self.entries.iter().position(|c| &c.node_id == node_id) else {
            return false;
        };
        self.entries.remove(pos);
        if let Some(replacement) = self.replacements.pop_front() {
            self.entries.push_back(replacement);
        }
        true
    }

    fn mark_seen(&mut self, node_id: &NodeId) {
        if let Some(pos) = self.entries.iter().position(|c| &c.node_id == node_id) {
            let mut contact = self.entries.remove(pos).expect("position is valid");
            contact.last_seen = SystemTime::now();
            contact.failed_requests = 0;
            self.entries.push_back(contact);
        }
    }

    fn record_failure(&mut self, node_id: &NodeId) {
        if let Some(contact) = self.entries.iter_mut().find(|c| &c.node_id == node_id) {
            contact.failed_requests += 1;
        }
    }

    fn get(&self, node_id: &NodeId) -> Option<NodeContact> {
        self.entries
            .iter()
            .find(|c| &c.node_id == node_id)
            .cloned()
    }

    fn contacts(&self) -> impl Iterator<Item = &NodeContact> {
        self.entries.iter()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Routing table statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingStats {
    pub total_nodes: usize,
    pub non_empty_buckets: usize,
    pub total_buckets: usize,
}

/// The full table: one bucket per bit of shared prefix.
///
/// Mutation is serialized per bucket; read operations walk the buckets and
/// take a snapshot.
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<RwLock<KBucket>>,
}

impl RoutingTable {
    /// Create an empty table for `local_id`.
    pub fn new(local_id: NodeId, k: usize) -> Self {
        let buckets = (0..ID_BITS).map(|_| RwLock::new(KBucket::new(k))).collect();
        Self {
            local_id,
            k,
            buckets,
        }
    }

    /// Our own id.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn bucket_for(&self, node_id: &NodeId) -> Option<&RwLock<KBucket>> {
        let index = self.local_id.bucket_index(node_id)?;
        Some(&self.buckets[index])
    }

    /// Offer a freshly observed contact to the table.
    ///
    /// Returns the oldest contact of a full bucket when the newcomer had to
    /// be parked; the engine probes it and calls [`RoutingTable::remove`] on
    /// failure. Offering our own id is a no-op.
    pub async fn insert(&self, contact: NodeContact) -> Option<NodeContact> {
        let bucket = self.bucket_for(&contact.node_id)?;
        let evicted_candidate = bucket.write().await.upsert(contact);
        if let Some(oldest) = &evicted_candidate {
            debug!(oldest = %oldest.node_id.short(), "bucket full, oldest contact needs probing");
        }
        evicted_candidate
    }

    /// Drop a contact after a failed probe or request.
    pub async fn remove(&self, node_id: &NodeId) -> bool {
        match self.bucket_for(node_id) {
            Some(bucket) => bucket.write().await.remove(node_id),
            None => false,
        }
    }

    /// Refresh a contact's position after it answered a request.
    pub async fn mark_seen(&self, node_id: &NodeId) {
        if let Some(bucket) = self.bucket_for(node_id) {
            bucket.write().await.mark_seen(node_id);
        }
    }

    /// Bump a contact's failure counter without removing it.
    pub async fn record_failure(&self, node_id: &NodeId) {
        if let Some(bucket) = self.bucket_for(node_id) {
            bucket.write().await.record_failure(node_id);
        }
    }

    /// Look up a specific contact.
    pub async fn get(&self, node_id: &NodeId) -> Option<NodeContact> {
        let bucket = self.bucket_for(node_id)?;
        let guard = bucket.read().await;
        guard.get(node_id)
    }

    /// The `count` contacts closest to `target`, sorted ascending by XOR
    /// distance. Ties (only possible for duplicate ids, which the table
    /// forbids) break on the id itself so ordering is deterministic.
    pub async fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeContact> {
        let mut all: Vec<(Distance, NodeContact)> = Vec::new();
        for bucket in &self.buckets {
            let guard = bucket.read().await;
            all.extend(
                guard
                    .contacts()
                    .map(|c| (target.distance(&c.node_id), c.clone())),
            );
        }
        all.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.node_id.cmp(&b.1.node_id)));
        all.into_iter().take(count).map(|(_, c)| c).collect()
    }

    /// Every contact in the table.
    pub async fn all_contacts(&self) -> Vec<NodeContact> {
        let mut all = Vec::new();
        for bucket in &self.buckets {
            let guard = bucket.read().await;
            all.extend(guard.contacts().cloned());
        }
        all
    }

    /// Number of contacts across all buckets.
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for bucket in &self.buckets {
            total += bucket.read().await.len();
        }
        total
    }

    /// True when no bucket holds any contact.
    pub async fn is_empty(&self) -> bool {
        for bucket in &self.buckets {
            if !bucket.read().await.is_empty() {
                return false;
            }
        }
        true
    }

    /// Contacts in a single bucket, oldest first. Test and diagnostics hook.
    pub async fn bucket_contacts(&self, index: usize) -> Vec<NodeContact> {
        if index >= ID_BITS {
            return Vec::new();
        }
        let guard = self.buckets[index].read().await;
        guard.contacts().cloned().collect()
    }

    /// Random lookup targets for empty buckets, used by bucket refresh.
    pub async fn refresh_targets(&self) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for (index, bucket) in self.buckets.iter().enumerate() {
            if bucket.read().await.is_empty() {
                targets.push(self.local_id.random_id_in_bucket(index));
            }
        }
        targets
    }

    /// Table statistics.
    pub async fn stats(&self) -> RoutingStats {
        let mut total_nodes = 0;
        let mut non_empty = 0;
        for bucket in &self.buckets {
            let len = bucket.read().await.len();
            if len > 0 {
                total_nodes += len;
                non_empty += 1;
            }
        }
        RoutingStats {
            total_nodes,
            non_empty_buckets: non_empty,
            total_buckets: ID_BITS,
        }
    }

    /// Bucket capacity this table was created with.
    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::{ID_BYTES, K};
    use std::net::Ipv4Addr;

    fn contact(node_id: NodeId, port: u16) -> NodeContact {
        NodeContact::new(node_id, IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Ids that all land in bucket 0 relative to an all-zero local id.
    fn far_id(salt: u8) -> NodeId {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = 0x80;
        bytes[ID_BYTES - 1] = salt;
        NodeId::from_bytes(bytes)
    }

    #[tokio::test]
    async fn insert_and_find_closest() {
        let table = RoutingTable::new(NodeId::random(), K);
        let peer = NodeId::random();
        assert!(table.insert(contact(peer, 9000)).await.is_none());

        let closest = table.closest(&peer, 5).await;
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].node_id, peer);
    }

    #[tokio::test]
    async fn own_id_is_never_stored() {
        let local = NodeId::random();
        let table = RoutingTable::new(local, K);
        assert!(table.insert(contact(local, 9000)).await.is_none());
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn reinsert_moves_contact_to_newest() {
        let local = NodeId::from_bytes([0u8; ID_BYTES]);
        let table = RoutingTable::new(local, K);
        for salt in 1..=3 {
            table.insert(contact(far_id(salt), 9000 + salt as u16)).await;
        }
        // Re-offer the oldest; it should move to the newest slot.
        table.insert(contact(far_id(1), 9001)).await;
        let bucket = table.bucket_contacts(0).await;
        assert_eq!(bucket.len(), 3);
        assert_eq!(bucket.last().expect("non-empty").node_id, far_id(1));
    }

    #[tokio::test]
    async fn full_bucket_refuses_eviction_and_parks_newcomer() {
        let local = NodeId::from_bytes([0u8; ID_BYTES]);
        let table = RoutingTable::new(local, K);

        for salt in 1..=K as u8 {
            assert!(table.insert(contact(far_id(salt), 9000)).await.is_none());
        }
        assert_eq!(table.bucket_contacts(0).await.len(), K);

        // The 21st contact does not displace anyone; the oldest is returned
        // for probing instead.
        let newcomer = far_id(K as u8 + 1);
        let oldest = table
            .insert(contact(newcomer, 9100))
            .await
            .expect("full bucket returns oldest");
        assert_eq!(oldest.node_id, far_id(1));

        let bucket = table.bucket_contacts(0).await;
        assert_eq!(bucket.len(), K);
        assert!(bucket.iter().all(|c| c.node_id != newcomer));

        // A successful probe re-offers the oldest: it keeps its slot at the
        // newest position and the newcomer stays parked.
        table.insert(contact(far_id(1), 9000)).await;
        let bucket = table.bucket_contacts(0).await;
        assert_eq!(bucket.len(), K);
        assert_eq!(bucket.last().expect("non-empty").node_id, far_id(1));
    }

    #[tokio::test]
    async fn removal_promotes_oldest_replacement() {
        let local = NodeId::from_bytes([0u8; ID_BYTES]);
        let table = RoutingTable::new(local, K);
        for salt in 1..=K as u8 {
            table.insert(contact(far_id(salt), 9000)).await;
        }
        let first_parked = far_id(K as u8 + 1);
        let second_parked = far_id(K as u8 + 2);
        table.insert(contact(first_parked, 9100)).await;
        table.insert(contact(second_parked, 9101)).await;

        // Failed probe on the oldest: it is dropped and the first parked
        // contact takes the slot.
        assert!(table.remove(&far_id(1)).await);
        let bucket = table.bucket_contacts(0).await;
        assert_eq!(bucket.len(), K);
        assert_eq!(bucket.last().expect("non-empty").node_id, first_parked);
    }

    #[tokio::test]
    async fn bucket_never_exceeds_k() {
        let local = NodeId::from_bytes([0u8; ID_BYTES]);
        let table = RoutingTable::new(local, K);
        for salt in 1..=60u8 {
            table.insert(contact(far_id(salt), 9000)).await;
        }
        assert_eq!(table.bucket_contacts(0).await.len(), K);
    }

    #[tokio::test]
    async fn closest_is_sorted_and_bounded() {
        let local = NodeId::random();
        let table = RoutingTable::new(local, K);
        for _ in 0..50 {
            table.insert(contact(NodeId::random(), 9000)).await;
        }
        let target = NodeId::random();
        let closest = table.closest(&target, K).await;
        assert_eq!(closest.len(), K.min(table.len().await));
        for pair in closest.windows(2) {
            assert!(target.distance(&pair[0].node_id) <= target.distance(&pair[1].node_id));
        }
        // No duplicates.
        let mut ids: Vec<_> = closest.iter().map(|c| c.node_id).collect();
        ids.dedup();
        assert_eq!(ids.len(), closest.len());
    }

    #[tokio::test]
    async fn closest_on_empty_table_is_empty() {
        let table = RoutingTable::new(NodeId::random(), K);
        assert!(table.closest(&NodeId::random(), K).await.is_empty());
    }

    #[tokio::test]
    async fn refresh_targets_fall_in_their_buckets() {
        let local = NodeId::random();
        let table = RoutingTable::new(local, K);
        let targets = table.refresh_targets().await;
        // Fresh table: every bucket is empty, so one target per bucket,
        // emitted in bucket order.
        assert_eq!(targets.len(), ID_BITS);
        for (bucket, target) in targets.iter().enumerate() {
            assert_eq!(local.bucket_index(target), Some(bucket));
        }
    }
}
