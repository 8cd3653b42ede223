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


//! Node configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::dht::DhtConfig;
use crate::manifest::DEFAULT_CHUNK_SIZE;

/// Configuration for a complete Shoal node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the UDP/TCP listeners bind to.
    pub host: IpAddr,
    /// UDP port for the DHT protocol. Port 0 picks an ephemeral port.
    pub dht_port: u16,
    /// TCP port for chunk/manifest transfer. Port 0 picks an ephemeral port.
    pub transfer_port: u16,
    /// Root directory for chunks, manifests and reassembled files.
    pub data_dir: PathBuf,
    /// Seed nodes for joining an existing network.
    pub bootstrap_nodes: Vec<SocketAddr>,
    /// Enable LAN broadcast discovery.
    pub auto_discover: bool,
    /// UDP port for discovery broadcasts.
    pub discovery_port: u16,
    /// How long to wait for LAN peers before bootstrapping.
    pub discovery_wait: Duration,
    /// Chunk size recorded in manifests created by this node.
    pub chunk_size: usize,
    /// Bound on concurrent in-flight chunk requests per download.
    pub max_concurrent_chunks: usize,
    /// Timeout for a single chunk fetch.
    pub chunk_timeout: Duration,
    /// Timeout for a manifest fetch.
    pub manifest_timeout: Duration,
    /// Timeout for establishing a transfer connection.
    pub connect_timeout: Duration,
    /// DHT engine tunables.
    pub dht: DhtConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dht_port: 8468,
            transfer_port: 8469,
            data_dir: PathBuf::from("./shoal_data"),
            bootstrap_nodes: Vec::new(),
            auto_discover: true,
            discovery_port: 8470,
            discovery_wait: Duration::from_secs(3),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: 5,
            chunk_timeout: Duration::from_secs(30),
            manifest_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            dht: DhtConfig::default(),
        }
    }
}
