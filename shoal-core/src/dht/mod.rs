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


//! Kademlia DHT for peer and content discovery.
//!
//! The DHT is built around four pieces:
//! - **Identifier algebra**: 160-bit node ids with the XOR distance metric
//! - **RoutingTable**: 160 k-buckets with LRU-with-replacement semantics
//! - **DhtTransport**: UDP request/response with message-id correlation
//! - **KademliaNode**: iterative lookups, store/announce and maintenance

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod kademlia;
pub mod protocol;
pub mod routing;
pub mod transport;

pub use kademlia::{DhtStats, KademliaNode};
pub use routing::{NodeContact, RoutingTable};

/// Number of bits in a node id.
pub const ID_BITS: usize = 160;
/// Number of bytes in a node id.
pub const ID_BYTES: usize = ID_BITS / 8;
/// Maximum contacts per k-bucket.
pub const K: usize = 20;
/// Lookup parallelism.
pub const ALPHA: usize = 3;

/// A 160-bit Kademlia identifier.
///
/// Used both for node identities and for content keys: the DHT key of a file
/// is the SHA-1 reduction of its 256-bit info hash, computed in
/// [`crate::node::dht_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// Create a NodeId from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Generate a uniformly random NodeId.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Parse a NodeId from a 40-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; ID_BYTES] = raw.try_into().ok()?;
        Some(Self(bytes))
    }

    /// XOR distance to another id.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Which k-bucket `other` belongs to relative to `self`.
    ///
    /// Bucket 0 holds ids differing in the most significant bit (furthest
    /// away); bucket 159 holds ids differing only in the least significant
    /// bit. Returns `None` when the ids are identical.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        self.distance(other).bucket_index()
    }

    /// Generate a random id whose distance from `self` falls in `bucket`.
    ///
    /// Used for bucket refreshes: looking this id up discovers nodes in the
    /// corresponding region of the id space.
    pub fn random_id_in_bucket(&self, bucket: usize) -> NodeId {
        debug_assert!(bucket < ID_BITS);
        let mut distance = [0u8; ID_BYTES];
        rand::thread_rng().fill(&mut distance[..]);

        let byte = bucket / 8;
        let bit = bucket % 8;
        // Zero everything more significant than the bucket bit, then set it,
        // so the highest differing bit lands exactly at position `bucket`.
        for b in distance.iter_mut().take(byte) {
            *b = 0;
        }
        let mask: u8 = 0x80 >> bit;
        distance[byte] = (distance[byte] & (mask - 1)) | mask;

        let mut out = [0u8; ID_BYTES];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ distance[i];
        }
        NodeId(out)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Hex string for display and wire encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex_str = String::deserialize(deserializer)?;
        NodeId::from_hex(&hex_str)
            .ok_or_else(|| serde::de::Error::custom("node id must be 40 hex characters"))
    }
}

/// XOR distance between two ids. Ordered big-endian, so `Ord` compares the
/// underlying 160-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_BYTES]);

impl Distance {
    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> u32 {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return (i * 8) as u32 + byte.leading_zeros();
            }
        }
        ID_BITS as u32
    }

    /// K-bucket index for this distance, `None` for the zero distance.
    ///
    /// Equal to the count of leading zero bits: bucket 0 is the far half of
    /// the id space, bucket 159 the immediate neighbourhood.
    pub fn bucket_index(&self) -> Option<usize> {
        let zeros = self.leading_zeros();
        if zeros as usize >= ID_BITS {
            None
        } else {
            Some(zeros as usize)
        }
    }

    /// True for the distance between identical ids.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

/// DHT engine tunables.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket capacity and lookup result width (K in Kademlia).
    pub k: usize,
    /// Lookup parallelism (alpha in Kademlia).
    pub alpha: usize,
    /// Deadline for a single UDP request.
    pub request_timeout: Duration,
    /// Cadence of the pending-request timeout sweep.
    pub sweep_interval: Duration,
    /// Cadence of the maintenance loop once bootstrapped.
    pub maintenance_interval: Duration,
    /// Age after which locally owned values are republished.
    pub republish_after: Duration,
    /// Age after which peer announcements are dropped.
    pub peer_expiry: Duration,
    /// How many empty buckets each maintenance cycle refreshes.
    pub refresh_per_cycle: usize,
    /// Largest value accepted by STORE, local or remote.
    pub max_value_size: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            request_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            maintenance_interval: Duration::from_secs(60),
            republish_after: Duration::from_secs(3600),
            peer_expiry: Duration::from_secs(1800),
            refresh_per_cycle: 5,
            max_value_size: 64 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let id = NodeId::random();
        assert!(id.distance(&id).is_zero());
        assert_eq!(id.bucket_index(&id), None);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn bucket_index_msb() {
        let zero = NodeId::from_bytes([0u8; ID_BYTES]);
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = 0b1000_0000;
        let far = NodeId::from_bytes(bytes);
        assert_eq!(zero.bucket_index(&far), Some(0));

        bytes[0] = 0b0100_0000;
        let nearer = NodeId::from_bytes(bytes);
        assert_eq!(zero.bucket_index(&nearer), Some(1));
    }

    #[test]
    fn bucket_index_lsb() {
        let zero = NodeId::from_bytes([0u8; ID_BYTES]);
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 1] = 1;
        let close = NodeId::from_bytes(bytes);
        assert_eq!(zero.bucket_index(&close), Some(159));
    }

    #[test]
    fn bucket_index_in_range_for_distinct_ids() {
        let a = NodeId::random();
        for _ in 0..100 {
            let b = NodeId::random();
            if a == b {
                continue;
            }
            let idx = a.bucket_index(&b).expect("distinct ids have a bucket");
            assert!(idx < ID_BITS);
        }
    }

    #[test]
    fn random_id_lands_in_requested_bucket() {
        let id = NodeId::random();
        for bucket in [0usize, 1, 7, 8, 42, 158, 159] {
            let target = id.random_id_in_bucket(bucket);
            assert_eq!(id.bucket_index(&target), Some(bucket));
        }
    }

    #[test]
    fn hex_round_trip() {
        let id = NodeId::random();
        let parsed = NodeId::from_hex(&id.to_hex()).expect("valid hex");
        assert_eq!(id, parsed);
        assert!(NodeId::from_hex("zz").is_none());
        assert!(NodeId::from_hex("abcd").is_none());
    }

    #[test]
    fn serde_uses_hex_strings() {
        let id = NodeId::random();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: NodeId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, back);
    }

    #[test]
    fn distance_orders_like_integers() {
        let zero = NodeId::from_bytes([0u8; ID_BYTES]);
        let mut one = [0u8; ID_BYTES];
        one[ID_BYTES - 1] = 1;
        let mut big = [0u8; ID_BYTES];
        big[0] = 1;
        assert!(zero.distance(&NodeId::from_bytes(one)) < zero.distance(&NodeId::from_bytes(big)));
    }
}
