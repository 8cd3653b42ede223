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


//! Pooled transfer client.
//!
//! One TCP connection per peer, shared between concurrent chunk requests.
//! The wire protocol has no per-request correlation id, so each connection
//! carries a lock that holds request and response together; a second
//! request waits until the first response is fully read. Timeouts and
//! integrity failures poison the stream state, so those paths drop the
//! pooled connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::protocol::TransferMessage;
use crate::error::{Error, Result};
use crate::manifest::FileManifest;

struct Connection {
    stream: Mutex<TcpStream>,
}

/// Transfer client with a `{peer address -> connection}` pool.
pub struct TransferClient {
    connections: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    connect_timeout: Duration,
    chunk_timeout: Duration,
    manifest_timeout: Duration,
}

impl TransferClient {
    pub fn new(
        connect_timeout: Duration,
        chunk_timeout: Duration,
        manifest_timeout: Duration,
    ) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            connect_timeout,
            chunk_timeout,
            manifest_timeout,
        }
    }

    async fn connection(&self, addr: SocketAddr) -> Result<Arc<Connection>> {
        let mut pool = self.connections.lock().await;
        if let Some(conn) = pool.get(&addr) {
            return Ok(conn.clone());
        }
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::PeerUnreachable(addr))?
            .map_err(|_| Error::PeerUnreachable(addr))?;
        let conn = Arc::new(Connection {
            stream: Mutex::new(stream),
        });
        pool.insert(addr, conn.clone());
        debug!(%addr, "transfer connection opened");
        Ok(conn)
    }

    /// Drop the pooled connection to `addr`, if any.
    pub async fn close(&self, addr: SocketAddr) {
        if self.connections.lock().await.remove(&addr).is_some() {
            debug!(%addr, "transfer connection closed");
        }
    }

    /// Drop every pooled connection.
    pub async fn close_all(&self) {
        self.connections.lock().await.clear();
    }

    /// One request/response exchange under the connection lock.
    async fn exchange(
        &self,
        addr: SocketAddr,
        request: TransferMessage,
        timeout: Duration,
    ) -> Result<TransferMessage> {
        let conn = self.connection(addr).await?;
        let exchange = async {
            let mut stream = conn.stream.lock().await;
            request.write_to(&mut *stream).await?;
            TransferMessage::read_from(&mut *stream)
                .await?
                .ok_or(Error::PeerUnreachable(addr))
        };
        let result = tokio::time::timeout(timeout, exchange)
            .await
            .unwrap_or_else(|_| Err(Error::Timeout(format!("transfer request to {addr}"))));

        if let Err(err) = &result {
            // NotFound is a well-formed answer; everything else leaves the
            // stream in an unknown state.
            if !matches!(err, Error::NotFound(_)) {
                self.close(addr).await;
            }
        }
        result
    }

    /// Fetch a chunk by hash. The returned bytes are NOT yet verified
    /// against the hash; the downloader does that before storing.
    pub async fn request_chunk(&self, addr: SocketAddr, hash: &str) -> Result<Vec<u8>> {
        let reply = self
            .exchange(
                addr,
                TransferMessage::RequestChunk {
                    hash: hash.to_string(),
                },
                self.chunk_timeout,
            )
            .await?;
        match reply {
            TransferMessage::ChunkData { hash: got, data } if got == hash => Ok(data),
            TransferMessage::ChunkNotFound { .. } => {
                Err(Error::NotFound(format!("chunk {hash} at {addr}")))
            }
            other => {
                self.close(addr).await;
                Err(Error::InvalidMessage(format!(
                    "unexpected {} reply to chunk request",
                    other.kind_name()
                )))
            }
        }
    }

    /// Fetch and parse a manifest, verifying its info hash matches the one
    /// requested.
    pub async fn request_manifest(
        &self,
        addr: SocketAddr,
        info_hash: &str,
    ) -> Result<FileManifest> {
        let reply = self
            .exchange(
                addr,
                TransferMessage::RequestManifest {
                    info_hash: info_hash.to_string(),
                },
                self.manifest_timeout,
            )
            .await?;
        match reply {
            TransferMessage::ManifestData { data, .. } => {
                let json = String::from_utf8(data)
                    .map_err(|_| Error::InvalidMessage("manifest is not UTF-8".into()))?;
                let manifest = FileManifest::from_json(&json)?;
                if manifest.info_hash != info_hash {
                    warn!(%addr, "peer served a manifest with the wrong info hash");
                    self.close(addr).await;
                    return Err(Error::Integrity(format!(
                        "manifest from {addr} identifies {} instead of {info_hash}",
                        manifest.info_hash
                    )));
                }
                Ok(manifest)
            }
            TransferMessage::ManifestNotFound { .. } => {
                Err(Error::NotFound(format!("manifest {info_hash} at {addr}")))
            }
            other => {
                self.close(addr).await;
                Err(Error::InvalidMessage(format!(
                    "unexpected {} reply to manifest request",
                    other.kind_name()
                )))
            }
        }
    }

    /// Health-check a peer's transfer endpoint.
    pub async fn ping(&self, addr: SocketAddr) -> Result<()> {
        match self
            .exchange(addr, TransferMessage::Ping, self.manifest_timeout)
            .await?
        {
            TransferMessage::Pong => Ok(()),
            other => {
                self.close(addr).await;
                Err(Error::InvalidMessage(format!(
                    "unexpected {} reply to ping",
                    other.kind_name()
                )))
            }
        }
    }
}
