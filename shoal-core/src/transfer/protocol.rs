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


//! Transfer wire protocol.
//!
//! Length-framed TCP messages:
//!
//! ```text
//! [u32 total_length][u32 header_length][header JSON][data bytes]
//! ```
//!
//! `total_length = header_length + data_length`, capped at 100 MiB. The
//! header is a JSON object carrying the message type, `data_length`, and
//! the chunk/info hash the message refers to. The protocol has no
//! per-request correlation id, so a connection must pair each request with
//! the next response before sending another (see the client's
//! per-connection lock).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Hard cap on a single framed message.
pub const MAX_MESSAGE_SIZE: u32 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum TransferKind {
    RequestChunk,
    ChunkData,
    ChunkNotFound,
    RequestManifest,
    ManifestData,
    ManifestNotFound,
    Ping,
    Pong,
}

#[derive(Debug, Serialize, Deserialize)]
struct TransferHeader {
    #[serde(rename = "type")]
    kind: TransferKind,
    data_length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    info_hash: Option<String>,
}

/// A transfer protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMessage {
    RequestChunk { hash: String },
    ChunkData { hash: String, data: Vec<u8> },
    ChunkNotFound { hash: String },
    RequestManifest { info_hash: String },
    ManifestData { info_hash: String, data: Vec<u8> },
    ManifestNotFound { info_hash: String },
    Ping,
    Pong,
}

impl TransferMessage {
    fn header_and_data(&self) -> (TransferHeader, &[u8]) {
        let (kind, chunk_hash, info_hash, data): (_, Option<&str>, Option<&str>, &[u8]) =
            match self {
                TransferMessage::RequestChunk { hash } => {
                    (TransferKind::RequestChunk, Some(hash), None, &[])
                }
                TransferMessage::ChunkData { hash, data } => {
                    (TransferKind::ChunkData, Some(hash), None, data.as_slice())
                }
                TransferMessage::ChunkNotFound { hash } => {
                    (TransferKind::ChunkNotFound, Some(hash), None, &[])
                }
                TransferMessage::RequestManifest { info_hash } => {
                    (TransferKind::RequestManifest, None, Some(info_hash), &[])
                }
                TransferMessage::ManifestData { info_hash, data } => (
                    TransferKind::ManifestData,
                    None,
                    Some(info_hash),
                    data.as_slice(),
                ),
                TransferMessage::ManifestNotFound { info_hash } => {
                    (TransferKind::ManifestNotFound, None, Some(info_hash), &[])
                }
                TransferMessage::Ping => (TransferKind::Ping, None, None, &[]),
                TransferMessage::Pong => (TransferKind::Pong, None, None, &[]),
            };
        (
            TransferHeader {
                kind,
                data_length: data.len() as u64,
                chunk_hash: chunk_hash.map(str::to_string),
                info_hash: info_hash.map(str::to_string),
            },
            data,
        )
    }

    /// Wire name of this message type, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TransferMessage::RequestChunk { .. } => "REQUEST_CHUNK",
            TransferMessage::ChunkData { .. } => "CHUNK_DATA",
            TransferMessage::ChunkNotFound { .. } => "CHUNK_NOT_FOUND",
            TransferMessage::RequestManifest { .. } => "REQUEST_MANIFEST",
            TransferMessage::ManifestData { .. } => "MANIFEST_DATA",
            TransferMessage::ManifestNotFound { .. } => "MANIFEST_NOT_FOUND",
            TransferMessage::Ping => "PING",
            TransferMessage::Pong => "PONG",
        }
    }

    /// Serialize into a framed byte buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (header, data) = self.header_and_data();
        let header_bytes = serde_json::to_vec(&header)?;
        let total = header_bytes.len() + data.len();
        if total as u64 > MAX_MESSAGE_SIZE as u64 {
            return Err(Error::InvalidMessage(format!(
                "message of {total} bytes exceeds the {MAX_MESSAGE_SIZE} byte cap"
            )));
        }

        let mut out = Vec::with_capacity(8 + total);
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(data);
        Ok(out)
    }

    /// Write a framed message to a stream.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.encode()?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one framed message from a stream.
    ///
    /// Returns `Ok(None)` on a clean close before the frame starts; a short
    /// read mid-frame or a malformed frame is an error and the caller must
    /// drop the connection.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let total = match reader.read_u32().await {
            Ok(total) => total,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if total > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidMessage(format!(
                "frame of {total} bytes exceeds the {MAX_MESSAGE_SIZE} byte cap"
            )));
        }

        let header_len = reader.read_u32().await?;
        if header_len > total {
            return Err(Error::InvalidMessage(format!(
                "header length {header_len} exceeds frame length {total}"
            )));
        }

        let mut header_bytes = vec![0u8; header_len as usize];
        reader.read_exact(&mut header_bytes).await?;
        let header: TransferHeader = serde_json::from_slice(&header_bytes)?;

        let data_len = (total - header_len) as usize;
        if header.data_length != data_len as u64 {
            return Err(Error::InvalidMessage(format!(
                "header says {} data bytes, frame carries {data_len}",
                header.data_length
            )));
        }
        let mut data = vec![0u8; data_len];
        reader.read_exact(&mut data).await?;

        let missing = |field: &str| Error::InvalidMessage(format!("header missing {field}"));
        let message = match header.kind {
            TransferKind::RequestChunk => TransferMessage::RequestChunk {
                hash: header.chunk_hash.ok_or_else(|| missing("chunk_hash"))?,
            },
            TransferKind::ChunkData => TransferMessage::ChunkData {
                hash: header.chunk_hash.ok_or_else(|| missing("chunk_hash"))?,
                data,
            },
            TransferKind::ChunkNotFound => TransferMessage::ChunkNotFound {
                hash: header.chunk_hash.ok_or_else(|| missing("chunk_hash"))?,
            },
            TransferKind::RequestManifest => TransferMessage::RequestManifest {
                info_hash: header.info_hash.ok_or_else(|| missing("info_hash"))?,
            },
            TransferKind::ManifestData => TransferMessage::ManifestData {
                info_hash: header.info_hash.ok_or_else(|| missing("info_hash"))?,
                data,
            },
            TransferKind::ManifestNotFound => TransferMessage::ManifestNotFound {
                info_hash: header.info_hash.ok_or_else(|| missing("info_hash"))?,
            },
            TransferKind::Ping => TransferMessage::Ping,
            TransferKind::Pong => TransferMessage::Pong,
        };
        Ok(Some(message))
    }
}
