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


//! The node facade.
//!
//! Thin composition over the subsystems: `share` chunks a file into the
//! store and announces it on the DHT, `download` resolves manifest and
//! peers through the DHT and hands the rest to the swarming downloader.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::chunk_store::{ChunkStore, StoreStats};
use crate::config::NodeConfig;
use crate::dht::{DhtStats, KademliaNode, NodeId};
use crate::discovery::{BroadcastDiscovery, DiscoveredPeer};
use crate::error::{Error, Result};
use crate::manifest::FileManifest;
use crate::transfer::{
    FileDownloader, ProgressSink, TransferClient, TransferServer, UploadStats,
};

/// Reduce a 256-bit info hash to the 160-bit DHT key space.
///
/// SHA-1 over the raw info-hash bytes; producer and consumer sides must
/// apply this same reduction for announcements and lookups to meet.
pub fn dht_key(info_hash: &str) -> Result<NodeId> {
    let bytes = hex::decode(info_hash)
        .map_err(|_| Error::InvalidMessage(format!("info hash is not hex: {info_hash:?}")))?;
    if bytes.len() != 32 {
        return Err(Error::InvalidMessage(format!(
            "info hash must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let digest = Sha1::digest(&bytes);
    let mut id = [0u8; 20];
    id.copy_from_slice(&digest);
    Ok(NodeId::from_bytes(id))
}

/// Aggregated node statistics for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_id: String,
    pub dht: DhtStats,
    pub store: StoreStats,
    pub uploads: UploadStats,
}

/// A complete file-sharing node.
pub struct Node {
    config: NodeConfig,
    node_id: NodeId,
    store: Arc<ChunkStore>,
    dht: Arc<KademliaNode>,
    server: TransferServer,
    client: Arc<TransferClient>,
    downloader: FileDownloader,
    discovery: Option<Arc<BroadcastDiscovery>>,
}

impl Node {
    /// Bring up every subsystem and join the network.
    #[instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>> {
        let node_id = NodeId::random();
        info!(id = %node_id.short(), "starting node");

        let store = Arc::new(ChunkStore::open(&config.data_dir).await?);

        let dht = KademliaNode::bind(
            node_id,
            SocketAddr::new(config.host, config.dht_port),
            config.dht.clone(),
        )
        .await?;
        dht.start().await;

        let server = TransferServer::start(
            store.clone(),
            SocketAddr::new(config.host, config.transfer_port),
        )
        .await?;

        let client = Arc::new(TransferClient::new(
            config.connect_timeout,
            config.chunk_timeout,
            config.manifest_timeout,
        ));
        let downloader =
            FileDownloader::new(store.clone(), client.clone(), config.max_concurrent_chunks);

        // LAN discovery feeds the routing table through a single ping per
        // discovered peer.
        let discovery = if config.auto_discover {
            match BroadcastDiscovery::start(
                node_id.to_hex(),
                dht.local_addr().port(),
                server.local_addr().port(),
                config.discovery_port,
            )
            .await
            {
                Ok(discovery) => {
                    let dht_for_events = dht.clone();
                    discovery
                        .on_peer_change(Arc::new(move |peer: &DiscoveredPeer, added| {
                            if added {
                                let dht = dht_for_events.clone();
                                let addr = peer.dht_addr();
                                tokio::spawn(async move {
                                    dht.ping(addr).await;
                                });
                            }
                        }))
                        .await;
                    Some(discovery)
                }
                Err(err) => {
                    warn!(%err, "LAN discovery unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        let node = Arc::new(Self {
            config,
            node_id,
            store,
            dht,
            server,
            client,
            downloader,
            discovery,
        });

        node.bootstrap().await;
        info!(
            id = %node.node_id.short(),
            dht = %node.dht.local_addr(),
            transfer = %node.server.local_addr(),
            "node started"
        );
        Ok(node)
    }

    async fn bootstrap(&self) {
        let mut seeds = self.config.bootstrap_nodes.clone();
        if let Some(discovery) = &self.discovery {
            discovery.discover(self.config.discovery_wait).await;
            seeds.extend(discovery.bootstrap_candidates().await);
        }
        seeds.sort();
        seeds.dedup();
        if let Err(err) = self.dht.bootstrap(&seeds).await {
            warn!(%err, "bootstrap failed");
        }
    }

    /// Shut everything down. Pending DHT requests complete with
    /// `Cancelled`; in-flight downloads are abandoned.
    pub async fn stop(&self) {
        if let Some(discovery) = &self.discovery {
            discovery.stop().await;
        }
        self.server.stop().await;
        self.client.close_all().await;
        self.dht.stop().await;
        info!(id = %self.node_id.short(), "node stopped");
    }

    /// Our 160-bit node id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Bound DHT endpoint.
    pub fn dht_addr(&self) -> SocketAddr {
        self.dht.local_addr()
    }

    /// Bound transfer endpoint.
    pub fn transfer_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    // === File operations ===

    /// Share a file: chunk it into the store, then make it discoverable by
    /// announcing our transfer endpoint and storing the manifest under the
    /// derived DHT key. Both DHT writes are best-effort.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn share(&self, path: &Path, description: &str) -> Result<FileManifest> {
        let mut manifest = self.store.store_file(path, self.config.chunk_size).await?;
        manifest.created_by = self.node_id.to_hex();
        manifest.description = description.to_string();
        self.store.put_manifest(&manifest).await?;

        let key = dht_key(&manifest.info_hash)?;
        let transfer_port = self.server.local_addr().port();
        if let Err(err) = self.dht.announce_peer(key, transfer_port).await {
            warn!(%err, "announce failed");
        }
        match self.dht.store(key, manifest.to_json()?).await {
            Ok(_) => {}
            Err(err) => warn!(%err, "manifest store failed, peers can still fetch it directly"),
        }

        info!(info_hash = %&manifest.info_hash[..16], "file shared");
        Ok(manifest)
    }

    /// Download a file by info hash.
    ///
    /// Resolution order: manifest from the DHT value store, peers from
    /// GET_PEERS, manifest from peers directly if the DHT had none, then
    /// the swarming downloader.
    #[instrument(skip(self, on_progress), fields(info_hash = %info_hash.get(..16).unwrap_or(info_hash)))]
    pub async fn download(
        &self,
        info_hash: &str,
        output: Option<&Path>,
        on_progress: Option<ProgressSink>,
    ) -> Result<PathBuf> {
        let key = dht_key(info_hash)?;

        let mut manifest = match self.dht.find_value(key).await? {
            Some(json) => match FileManifest::from_json(&json) {
                Ok(manifest) if manifest.info_hash == info_hash => Some(manifest),
                Ok(_) => {
                    warn!("DHT value carries the wrong info hash, ignoring");
                    None
                }
                Err(err) => {
                    warn!(%err, "DHT value is not a manifest, ignoring");
                    None
                }
            },
            None => None,
        };

        let peers = self.dht.get_peers(key).await?;
        if peers.is_empty() {
            return Err(Error::NotFound(format!(
                "no peers announced for {info_hash}"
            )));
        }
        info!(peers = peers.len(), "found peers");

        if manifest.is_none() {
            for peer in &peers {
                match self.client.request_manifest(*peer, info_hash).await {
                    Ok(fetched) => {
                        manifest = Some(fetched);
                        break;
                    }
                    Err(err) => {
                        warn!(%peer, %err, "manifest fetch failed, trying next peer");
                    }
                }
            }
        }
        let manifest = manifest
            .ok_or_else(|| Error::NotFound(format!("manifest for {info_hash} unavailable")))?;

        self.downloader
            .download(&manifest, &peers, on_progress, output)
            .await
    }

    /// Manifests of every file stored locally.
    pub async fn list_files(&self) -> Result<Vec<FileManifest>> {
        self.store.list_manifests().await
    }

    /// Manifest for a specific file, if stored locally.
    pub async fn file_info(&self, info_hash: &str) -> Result<Option<FileManifest>> {
        self.store.get_manifest(info_hash).await
    }

    /// Stop sharing a file by deleting its manifest. Chunks remain until
    /// orphan cleanup.
    pub async fn remove_file(&self, info_hash: &str) -> Result<bool> {
        self.store.delete_manifest(info_hash).await
    }

    // === Introspection ===

    /// LAN peers currently visible.
    pub async fn lan_peers(&self) -> Vec<DiscoveredPeer> {
        match &self.discovery {
            Some(discovery) => discovery.peers().await,
            None => Vec::new(),
        }
    }

    /// Aggregated statistics.
    pub async fn stats(&self) -> Result<NodeStats> {
        Ok(NodeStats {
            node_id: self.node_id.to_hex(),
            dht: self.dht.stats().await,
            store: self.store.stats().await?,
            uploads: self.server.stats(),
        })
    }

    /// The underlying DHT engine, for diagnostics and tests.
    pub fn dht(&self) -> &Arc<KademliaNode> {
        &self.dht
    }

    /// The underlying chunk store.
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dht_key_is_sha1_of_info_hash_bytes() {
        // SHA-256("") reduced with SHA-1; both sides of the network must
        // derive this same key.
        let info_hash = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let key = dht_key(info_hash).expect("derive");

        let bytes = hex::decode(info_hash).expect("hex");
        let expected = Sha1::digest(&bytes);
        assert_eq!(key.as_bytes()[..], expected[..]);
    }

    #[test]
    fn dht_key_rejects_bad_input() {
        assert!(dht_key("not hex").is_err());
        assert!(dht_key("abcd").is_err());
        // 20 bytes instead of 32.
        assert!(dht_key(&"ab".repeat(20)).is_err());
    }

    #[test]
    fn dht_key_is_deterministic() {
        let info_hash = "a".repeat(64);
        assert_eq!(
            dht_key(&info_hash).expect("derive"),
            dht_key(&info_hash).expect("derive")
        );
    }
}
