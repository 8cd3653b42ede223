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


//! File manifests.
//!
//! A manifest is the metadata a peer needs to fetch and verify a file:
//! which chunks exist, their SHA-256 hashes, and the SHA-256 of the whole
//! content (the `info_hash`, the file's canonical identity). Manifests are
//! stored and exchanged verbatim as JSON. Note `info_hash` is a hash of the
//! file content, never of the manifest document itself.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};

/// Default chunk size: 256 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// SHA-256 of `data` as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// One chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Position in the file, starting at 0.
    pub index: u64,
    /// SHA-256 of the chunk bytes, hex.
    pub hash: String,
    /// Chunk length in bytes; only the last chunk may be short.
    pub size: u64,
    /// Byte offset in the original file.
    pub offset: u64,
}

/// Complete metadata for a shared file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifest {
    pub name: String,
    pub size: u64,
    /// SHA-256 of the full file content, hex. The canonical file identity.
    pub info_hash: String,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkInfo>,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub description: String,
}

impl FileManifest {
    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunk metadata by index.
    pub fn chunk(&self, index: u64) -> Option<&ChunkInfo> {
        self.chunks.get(index as usize)
    }

    /// Chunk metadata by hash.
    pub fn chunk_by_hash(&self, hash: &str) -> Option<&ChunkInfo> {
        self.chunks.iter().find(|c| c.hash == hash)
    }

    /// Verify chunk bytes against the recorded hash.
    pub fn verify_chunk(&self, index: u64, data: &[u8]) -> bool {
        self.chunk(index)
            .map(|chunk| sha256_hex(data) == chunk.hash)
            .unwrap_or(false)
    }

    /// Serialize to the JSON document stored on disk and in the DHT.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::from)
    }

    /// Parse a manifest document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Error::from)
    }
}

/// Fill `buf` from the reader, stopping only at EOF. Plain `read` may
/// return short counts well before a chunk boundary.
pub(crate) async fn read_chunk(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Build a manifest for a file in a single pass: one `ChunkInfo` per read,
/// with the file hash accumulated over the same bytes.
pub async fn create_manifest(
    path: &Path,
    chunk_size: usize,
    created_by: &str,
) -> Result<FileManifest> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::NotFound(format!("no file name in {}", path.display())))?;

    let mut file = File::open(path)
        .await
        .map_err(|_| Error::NotFound(format!("file not found: {}", path.display())))?;

    let mut chunks = Vec::new();
    let mut file_hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size];
    let mut offset = 0u64;
    let mut index = 0u64;

    loop {
        let n = read_chunk(&mut file, &mut buf).await?;
        if n == 0 {
            break;
        }
        let data = &buf[..n];
        file_hasher.update(data);
        chunks.push(ChunkInfo {
            index,
            hash: sha256_hex(data),
            size: n as u64,
            offset,
        });
        offset += n as u64;
        index += 1;
    }

    let mime_type = mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string();

    Ok(FileManifest {
        name,
        size: offset,
        info_hash: hex::encode(file_hasher.finalize()),
        chunk_size: chunk_size as u64,
        chunks,
        created_at: Utc::now().timestamp_millis() as f64 / 1000.0,
        created_by: created_by.to_string(),
        mime_type,
        description: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(data).expect("write");
        file.flush().expect("flush");
        file
    }

    #[tokio::test]
    async fn manifest_covers_whole_file() {
        // 700_000 bytes at 256 KiB: two full chunks and a short tail.
        let data: Vec<u8> = (0..700_000u32).map(|i| (i % 251) as u8).collect();
        let file = write_temp(&data);
        let manifest = create_manifest(file.path(), DEFAULT_CHUNK_SIZE, "test-node")
            .await
            .expect("manifest");

        assert_eq!(manifest.size, 700_000);
        assert_eq!(manifest.chunk_count(), 3);
        assert_eq!(manifest.chunks[0].size, 262_144);
        assert_eq!(manifest.chunks[1].size, 262_144);
        assert_eq!(manifest.chunks[2].size, 700_000 - 2 * 262_144);
        assert_eq!(manifest.info_hash, sha256_hex(&data));

        let mut expected_offset = 0;
        for (i, chunk) in manifest.chunks.iter().enumerate() {
            assert_eq!(chunk.index, i as u64);
            assert_eq!(chunk.offset, expected_offset);
            expected_offset += chunk.size;
        }
        assert_eq!(expected_offset, manifest.size);
    }

    #[tokio::test]
    async fn chunk_hashes_match_content() {
        let data = vec![7u8; DEFAULT_CHUNK_SIZE + 10];
        let file = write_temp(&data);
        let manifest = create_manifest(file.path(), DEFAULT_CHUNK_SIZE, "")
            .await
            .expect("manifest");

        assert!(manifest.verify_chunk(0, &data[..DEFAULT_CHUNK_SIZE]));
        assert!(manifest.verify_chunk(1, &data[DEFAULT_CHUNK_SIZE..]));
        assert!(!manifest.verify_chunk(0, b"altered"));
        assert!(!manifest.verify_chunk(99, &data));
    }

    #[tokio::test]
    async fn empty_file_has_zero_chunks() {
        let file = write_temp(b"");
        let manifest = create_manifest(file.path(), DEFAULT_CHUNK_SIZE, "")
            .await
            .expect("manifest");
        assert_eq!(manifest.size, 0);
        assert_eq!(manifest.chunk_count(), 0);
        assert_eq!(manifest.info_hash, sha256_hex(b""));
    }

    #[tokio::test]
    async fn json_round_trip_preserves_manifest() {
        let data = vec![1u8; 1000];
        let file = write_temp(&data);
        let manifest = create_manifest(file.path(), 256, "node-a")
            .await
            .expect("manifest");

        let json = manifest.to_json().expect("to json");
        let back = FileManifest::from_json(&json).expect("from json");
        assert_eq!(back.info_hash, manifest.info_hash);
        assert_eq!(back.chunks, manifest.chunks);
        assert_eq!(back.name, manifest.name);
        assert_eq!(back.size, manifest.size);
    }

    #[test]
    fn manifest_tolerates_missing_optional_fields() {
        let json = r#"{"name":"a.bin","size":0,"info_hash":"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855","chunk_size":262144,"chunks":[]}"#;
        let manifest = FileManifest::from_json(json).expect("parse");
        assert_eq!(manifest.created_by, "");
        assert_eq!(manifest.mime_type, "");
    }
}
