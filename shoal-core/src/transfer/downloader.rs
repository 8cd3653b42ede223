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


//! Swarming downloader.
//!
//! Missing chunks are spread over the peer set round-robin after a
//! per-download shuffle: independent downloads land on different peers
//! first, and each peer gets an even share without needing availability
//! estimates. Chunks that fail anywhere are retried against every peer in
//! order before the download is declared dead. Every state change is
//! pushed to the progress sink while the progress lock is held, so sinks
//! must copy and return instead of blocking.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};

use super::client::TransferClient;
use crate::chunk_store::ChunkStore;
use crate::error::{Error, Result};
use crate::manifest::{ChunkInfo, FileManifest, sha256_hex};

/// Lifecycle of one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPhase {
    Initializing,
    FindingPeers,
    Downloading,
    Merging,
    Complete,
    Failed,
}

/// Per-chunk download state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Downloading,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub index: u64,
    pub status: ChunkStatus,
    pub size: u64,
    /// Peer currently serving (or last to have served) this chunk.
    pub peer: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerProgress {
    pub addr: SocketAddr,
    pub chunks_assigned: usize,
    pub chunks_completed: usize,
    pub chunks_failed: usize,
    pub bytes_downloaded: u64,
}

/// Snapshot of a download, pushed to the progress sink on every change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub file_name: String,
    pub file_size: u64,
    pub phase: DownloadPhase,
    /// Chunks this download set out to fetch (already-present chunks are
    /// not counted).
    pub total_chunks: usize,
    pub downloaded_chunks: usize,
    pub failed_chunks: usize,
    pub bytes_downloaded: u64,
    /// Chunk state keyed by chunk hash.
    pub chunks: BTreeMap<String, ChunkProgress>,
    /// Peer contribution keyed by `ip:port`.
    pub peers: BTreeMap<String, PeerProgress>,
}

impl DownloadProgress {
    fn new(manifest: &FileManifest) -> Self {
        Self {
            file_name: manifest.name.clone(),
            file_size: manifest.size,
            phase: DownloadPhase::Initializing,
            total_chunks: 0,
            downloaded_chunks: 0,
            failed_chunks: 0,
            bytes_downloaded: 0,
            chunks: BTreeMap::new(),
            peers: BTreeMap::new(),
        }
    }

    /// Completed fraction, 0.0 to 1.0.
    pub fn ratio(&self) -> f64 {
        if self.total_chunks == 0 {
            1.0
        } else {
            self.downloaded_chunks as f64 / self.total_chunks as f64
        }
    }
}

/// Callback receiving progress snapshots. Invoked while the progress lock
/// is held: copy what you need and return.
pub type ProgressSink = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

struct DownloadState {
    progress: Mutex<DownloadProgress>,
    sink: Option<ProgressSink>,
    failed: Mutex<Vec<String>>,
    in_flight: Semaphore,
}

impl DownloadState {
    async fn update(&self, mutate: impl FnOnce(&mut DownloadProgress)) {
        let mut progress = self.progress.lock().await;
        mutate(&mut progress);
        if let Some(sink) = &self.sink {
            sink(&progress);
        }
    }
}

fn peer_key(addr: &SocketAddr) -> String {
    addr.to_string()
}

/// Coordinates multi-peer downloads against the local chunk store.
pub struct FileDownloader {
    store: Arc<ChunkStore>,
    client: Arc<TransferClient>,
    max_in_flight: usize,
}

impl FileDownloader {
    pub fn new(store: Arc<ChunkStore>, client: Arc<TransferClient>, max_in_flight: usize) -> Self {
        Self {
            store,
            client,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Download every missing chunk of `manifest` from `peers`, then
    /// reassemble and verify the file.
    ///
    /// Returns the output path, or `NotFound` once at least one chunk could
    /// not be obtained from any peer.
    #[instrument(skip_all, fields(file = %manifest.name, peers = peers.len()))]
    pub async fn download(
        &self,
        manifest: &FileManifest,
        peers: &[SocketAddr],
        sink: Option<ProgressSink>,
        output: Option<&Path>,
    ) -> Result<PathBuf> {
        self.store.put_manifest(manifest).await?;

        let state = Arc::new(DownloadState {
            progress: Mutex::new(DownloadProgress::new(manifest)),
            sink,
            failed: Mutex::new(Vec::new()),
            in_flight: Semaphore::new(self.max_in_flight),
        });

        let missing = self.store.missing_chunks(manifest).await;
        if missing.is_empty() {
            info!("all chunks already present");
            return self.merge(manifest, output, &state).await;
        }
        if peers.is_empty() {
            state.update(|p| p.phase = DownloadPhase::Failed).await;
            return Err(Error::NotFound("no peers serve this file".into()));
        }

        // Per-download random peer order: concurrent downloaders start on
        // different peers instead of herding onto the same one.
        let mut peers: Vec<SocketAddr> = peers.to_vec();
        peers.shuffle(&mut rand::thread_rng());

        // Round-robin by position: chunk i goes to peers[i % n].
        let mut assignments: Vec<(SocketAddr, Vec<ChunkInfo>)> =
            peers.iter().map(|addr| (*addr, Vec::new())).collect();
        let missing_chunks: Vec<ChunkInfo> = missing
            .iter()
            .filter_map(|hash| manifest.chunk_by_hash(hash).cloned())
            .collect();
        for (i, chunk) in missing_chunks.iter().enumerate() {
            assignments[i % peers.len()].1.push(chunk.clone());
        }

        state
            .update(|p| {
                p.phase = DownloadPhase::FindingPeers;
                p.total_chunks = missing_chunks.len();
                for chunk in &missing_chunks {
                    p.chunks.insert(
                        chunk.hash.clone(),
                        ChunkProgress {
                            index: chunk.index,
                            status: ChunkStatus::Pending,
                            size: chunk.size,
                            peer: None,
                        },
                    );
                }
                for (addr, chunks) in &assignments {
                    p.peers.insert(
                        peer_key(addr),
                        PeerProgress {
                            addr: *addr,
                            chunks_assigned: chunks.len(),
                            chunks_completed: 0,
                            chunks_failed: 0,
                            bytes_downloaded: 0,
                        },
                    );
                }
                p.phase = DownloadPhase::Downloading;
            })
            .await;

        info!(
            missing = missing_chunks.len(),
            total = manifest.chunk_count(),
            "downloading chunks"
        );

        // One concurrent task per peer, each working through its share
        // sequentially; total in-flight requests bounded by the semaphore.
        join_all(
            assignments
                .iter()
                .filter(|(_, chunks)| !chunks.is_empty())
                .map(|(addr, chunks)| self.download_from_peer(&state, *addr, chunks)),
        )
        .await;

        // Retry pass: every failed chunk tries every peer in order.
        let failed: Vec<String> = {
            let mut failed = state.failed.lock().await;
            let mut drained: Vec<String> = failed.drain(..).collect();
            drained.sort();
            drained.dedup();
            drained
        };
        if !failed.is_empty() {
            info!(failed = failed.len(), "retrying failed chunks on alternate peers");
            join_all(failed.iter().filter_map(|hash| {
                manifest
                    .chunk_by_hash(hash)
                    .map(|chunk| self.retry_chunk(&state, &peers, chunk))
            }))
            .await;
        }

        let still_missing = self.store.missing_chunks(manifest).await;
        if !still_missing.is_empty() {
            warn!(missing = still_missing.len(), "download incomplete");
            state
                .update(|p| {
                    p.failed_chunks = still_missing.len();
                    p.phase = DownloadPhase::Failed;
                })
                .await;
            return Err(Error::NotFound(format!(
                "{} chunks unobtainable from any peer",
                still_missing.len()
            )));
        }

        self.merge(manifest, output, &state).await
    }

    async fn merge(
        &self,
        manifest: &FileManifest,
        output: Option<&Path>,
        state: &Arc<DownloadState>,
    ) -> Result<PathBuf> {
        state.update(|p| p.phase = DownloadPhase::Merging).await;
        match self.store.reassemble(manifest, output).await {
            Ok(path) => {
                state.update(|p| p.phase = DownloadPhase::Complete).await;
                info!(path = %path.display(), "download complete");
                Ok(path)
            }
            Err(err) => {
                state.update(|p| p.phase = DownloadPhase::Failed).await;
                Err(err)
            }
        }
    }

    async fn download_from_peer(
        &self,
        state: &Arc<DownloadState>,
        addr: SocketAddr,
        chunks: &[ChunkInfo],
    ) {
        for chunk in chunks {
            if !self.fetch_chunk(state, addr, chunk).await {
                state.failed.lock().await.push(chunk.hash.clone());
            }
        }
    }

    async fn retry_chunk(&self, state: &Arc<DownloadState>, peers: &[SocketAddr], chunk: &ChunkInfo) {
        for addr in peers {
            if self.store.has_chunk(&chunk.hash).await {
                return;
            }
            if self.fetch_chunk(state, *addr, chunk).await {
                return;
            }
        }
        debug!(chunk = %chunk.hash.get(..16).unwrap_or(&chunk.hash), "all peers failed");
    }

    /// Fetch, verify and store one chunk. Returns whether it succeeded.
    async fn fetch_chunk(
        &self,
        state: &Arc<DownloadState>,
        addr: SocketAddr,
        chunk: &ChunkInfo,
    ) -> bool {
        let _permit = state
            .in_flight
            .acquire()
            .await
            .expect("semaphore never closed");

        state
            .update(|p| {
                if let Some(entry) = p.chunks.get_mut(&chunk.hash) {
                    entry.status = ChunkStatus::Downloading;
                    entry.peer = Some(addr);
                }
            })
            .await;

        let outcome = match self.client.request_chunk(addr, &chunk.hash).await {
            Ok(data) => {
                if sha256_hex(&data) != chunk.hash {
                    // A peer serving altered bytes is not trusted further on
                    // this connection.
                    warn!(%addr, chunk = %chunk.hash.get(..16).unwrap_or(&chunk.hash), "chunk failed verification");
                    self.client.close(addr).await;
                    Err(Error::Integrity("chunk hash mismatch".into()))
                } else {
                    self.store.put_chunk(&chunk.hash, &data).await.map(|_| data)
                }
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(data) => {
                state
                    .update(|p| {
                        p.downloaded_chunks += 1;
                        p.bytes_downloaded += data.len() as u64;
                        if let Some(entry) = p.chunks.get_mut(&chunk.hash) {
                            entry.status = ChunkStatus::Complete;
                            entry.peer = Some(addr);
                        }
                        if let Some(peer) = p.peers.get_mut(&peer_key(&addr)) {
                            peer.chunks_completed += 1;
                            peer.bytes_downloaded += data.len() as u64;
                        }
                    })
                    .await;
                true
            }
            Err(err) => {
                debug!(%addr, chunk = %chunk.hash.get(..16).unwrap_or(&chunk.hash), %err, "chunk fetch failed");
                state
                    .update(|p| {
                        if let Some(entry) = p.chunks.get_mut(&chunk.hash) {
                            entry.status = ChunkStatus::Failed;
                        }
                        if let Some(peer) = p.peers.get_mut(&peer_key(&addr)) {
                            peer.chunks_failed += 1;
                        }
                    })
                    .await;
                false
            }
        }
    }
}
