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


//! Transfer server: serves chunks and manifests to requesting peers.
//!
//! Each accepted connection runs its own request loop. A malformed frame
//! drops only that connection; an unknown-but-parsable message is logged
//! and skipped.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::TransferMessage;
use crate::chunk_store::ChunkStore;
use crate::error::{Error, Result};

/// Upload counters, shaped for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStats {
    pub chunks_served: u64,
    pub bytes_uploaded: u64,
}

#[derive(Default)]
struct Counters {
    chunks_served: AtomicU64,
    bytes_uploaded: AtomicU64,
}

/// TCP server answering chunk and manifest requests from the local store.
pub struct TransferServer {
    local_addr: SocketAddr,
    counters: Arc<Counters>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransferServer {
    /// Bind `addr` and start serving. Port 0 picks an ephemeral port.
    pub async fn start(store: Arc<ChunkStore>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let counters = Arc::new(Counters::default());

        let loop_counters = counters.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "transfer connection accepted");
                        let store = store.clone();
                        let counters = loop_counters.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(store, counters, stream).await {
                                debug!(%peer, %err, "transfer connection ended");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                    }
                }
            }
        });

        info!(%local_addr, "transfer server listening");
        Ok(Self {
            local_addr,
            counters,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// The address the listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Upload counters.
    pub fn stats(&self) -> UploadStats {
        UploadStats {
            chunks_served: self.counters.chunks_served.load(Ordering::Relaxed),
            bytes_uploaded: self.counters.bytes_uploaded.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting connections.
    pub async fn stop(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        info!(addr = %self.local_addr, "transfer server stopped");
    }
}

async fn serve_connection(
    store: Arc<ChunkStore>,
    counters: Arc<Counters>,
    mut stream: TcpStream,
) -> Result<()> {
    loop {
        let Some(message) = TransferMessage::read_from(&mut stream).await? else {
            return Ok(());
        };

        let reply = match message {
            TransferMessage::RequestChunk { hash } => match store.get_chunk(&hash).await {
                Ok(data) => {
                    counters.chunks_served.fetch_add(1, Ordering::Relaxed);
                    counters
                        .bytes_uploaded
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    TransferMessage::ChunkData { hash, data }
                }
                Err(Error::NotFound(_)) | Err(Error::InvalidMessage(_)) => {
                    TransferMessage::ChunkNotFound { hash }
                }
                Err(err) => {
                    warn!(%err, "chunk read failed");
                    TransferMessage::ChunkNotFound { hash }
                }
            },

            TransferMessage::RequestManifest { info_hash } => {
                match store.get_manifest(&info_hash).await {
                    Ok(Some(manifest)) => TransferMessage::ManifestData {
                        info_hash,
                        data: manifest.to_json()?.into_bytes(),
                    },
                    Ok(None) | Err(Error::InvalidMessage(_)) => {
                        TransferMessage::ManifestNotFound { info_hash }
                    }
                    Err(err) => {
                        warn!(%err, "manifest read failed");
                        TransferMessage::ManifestNotFound { info_hash }
                    }
                }
            }

            TransferMessage::Ping => TransferMessage::Pong,

            other => {
                warn!(kind = other.kind_name(), "no handler for message, skipping");
                continue;
            }
        };

        reply.write_to(&mut stream).await?;
    }
}
