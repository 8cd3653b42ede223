// Copyright (c) 2025 Saorsa Labs Limited
//
// This file is part of the Saorsa P2P network.
//
// Licensed under the AGPL-3.0 license:
// <https://www.gnu.org/licenses/agpl-3.0.html>
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Shoal core - a self-organizing P2P file-sharing node.
//!
//! Files are identified by the SHA-256 of their content (the info hash),
//! split into fixed-size content-addressed chunks, and located through a
//! Kademlia DHT. Downloads swarm across every peer that announced the
//! file, with per-chunk integrity verification and retry across
//! alternates.
//!
//! The usual entry point is [`Node`]: `share` a file, `download` an info
//! hash.

pub mod chunk_store;
pub mod config;
pub mod dht;
pub mod discovery;
pub mod error;
pub mod manifest;
pub mod node;
pub mod transfer;

// Re-export the types most callers need.
pub use chunk_store::{ChunkStore, StoreStats};
pub use config::NodeConfig;
pub use dht::{DhtConfig, KademliaNode, NodeId};
pub use discovery::{BroadcastDiscovery, DiscoveredPeer};
pub use error::{Error, Result};
pub use manifest::{ChunkInfo, DEFAULT_CHUNK_SIZE, FileManifest, create_manifest};
pub use node::{Node, NodeStats, dht_key};
pub use transfer::{
    DownloadPhase, DownloadProgress, FileDownloader, ProgressSink, TransferClient, TransferServer,
};
