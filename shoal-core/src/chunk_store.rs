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


//! Content-addressed chunk storage.
//!
//! On-disk layout:
//!
//! ```text
//! <root>/chunks/<aa>/<full-hex>     chunk bytes, named by their SHA-256
//! <root>/manifests/<info_hash>.json manifest documents
//! <root>/files/                     reassembled outputs
//! <root>/temp/                      in-progress writes
//! ```
//!
//! Every chunk and every reassembled file is written into `temp/` and
//! renamed over its final path, so a crash never leaves a partial file
//! visible. Reads re-hash the content; a chunk that fails verification is
//! deleted and reported as missing, which lets the next download repair it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::manifest::{FileManifest, create_manifest, read_chunk, sha256_hex};

/// Storage statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_chunks: usize,
    pub total_bytes: u64,
    pub manifest_count: usize,
}

/// Local store for chunks, manifests and reassembled files.
pub struct ChunkStore {
    chunks_dir: PathBuf,
    manifests_dir: PathBuf,
    files_dir: PathBuf,
    temp_dir: PathBuf,
}

fn is_hex64(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl ChunkStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let store = Self {
            chunks_dir: root.join("chunks"),
            manifests_dir: root.join("manifests"),
            files_dir: root.join("files"),
            temp_dir: root.join("temp"),
        };
        for dir in [
            &store.chunks_dir,
            &store.manifests_dir,
            &store.files_dir,
            &store.temp_dir,
        ] {
            fs::create_dir_all(dir).await?;
        }
        Ok(store)
    }

    /// Directory reassembled files land in by default.
    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    fn chunk_path(&self, hash: &str) -> Result<PathBuf> {
        // Hashes come off the wire; anything that is not plain hex is
        // rejected before it can touch a path.
        if !is_hex64(hash) {
            return Err(Error::InvalidMessage(format!(
                "chunk hash is not 64 hex characters: {hash:?}"
            )));
        }
        Ok(self.chunks_dir.join(&hash[..2]).join(hash))
    }

    fn manifest_path(&self, info_hash: &str) -> Result<PathBuf> {
        if !is_hex64(info_hash) {
            return Err(Error::InvalidMessage(format!(
                "info hash is not 64 hex characters: {info_hash:?}"
            )));
        }
        Ok(self.manifests_dir.join(format!("{info_hash}.json")))
    }

    fn temp_path(&self, label: &str) -> PathBuf {
        let nonce: u64 = rand::thread_rng().r#gen();
        self.temp_dir.join(format!("{label}.{nonce:016x}.tmp"))
    }

    async fn write_atomic(&self, final_path: &Path, label: &str, data: &[u8]) -> Result<()> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path(label);
        fs::write(&temp, data).await?;
        fs::rename(&temp, final_path).await?;
        Ok(())
    }

    // === Chunks ===

    /// Store a chunk, verifying the content hashes to `hash` first.
    pub async fn put_chunk(&self, hash: &str, data: &[u8]) -> Result<()> {
        let actual = sha256_hex(data);
        if actual != hash {
            return Err(Error::Integrity(format!(
                "chunk content hashes to {actual}, expected {hash}"
            )));
        }
        let path = self.chunk_path(hash)?;
        self.write_atomic(&path, hash, data).await
    }

    /// Fetch a chunk. Content that no longer matches its name is deleted
    /// and reported as missing.
    pub async fn get_chunk(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.chunk_path(hash)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("chunk {hash}")));
            }
            Err(err) => return Err(err.into()),
        };
        if sha256_hex(&data) != hash {
            warn!(chunk = %&hash[..16], "corrupted chunk on disk, deleting");
            let _ = fs::remove_file(&path).await;
            return Err(Error::NotFound(format!("chunk {hash}")));
        }
        Ok(data)
    }

    /// Whether a chunk file exists (without verifying its content).
    pub async fn has_chunk(&self, hash: &str) -> bool {
        match self.chunk_path(hash) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Delete a chunk. Returns whether it existed.
    pub async fn delete_chunk(&self, hash: &str) -> Result<bool> {
        let path = self.chunk_path(hash)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    // === Manifests ===

    /// Store a manifest document keyed by its info hash.
    pub async fn put_manifest(&self, manifest: &FileManifest) -> Result<()> {
        let path = self.manifest_path(&manifest.info_hash)?;
        self.write_atomic(&path, &manifest.info_hash, manifest.to_json()?.as_bytes())
            .await
    }

    /// Load a manifest, or `None` if absent.
    pub async fn get_manifest(&self, info_hash: &str) -> Result<Option<FileManifest>> {
        let path = self.manifest_path(info_hash)?;
        match fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(FileManifest::from_json(&json)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether a manifest exists.
    pub async fn has_manifest(&self, info_hash: &str) -> bool {
        match self.manifest_path(info_hash) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Delete a manifest. Returns whether it existed.
    pub async fn delete_manifest(&self, info_hash: &str) -> Result<bool> {
        let path = self.manifest_path(info_hash)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// All stored manifests. Unparsable documents are skipped.
    pub async fn list_manifests(&self) -> Result<Vec<FileManifest>> {
        let mut manifests = Vec::new();
        let mut entries = fs::read_dir(&self.manifests_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().map(|e| e == "json") != Some(true) {
                continue;
            }
            match fs::read_to_string(entry.path()).await {
                Ok(json) => match FileManifest::from_json(&json) {
                    Ok(manifest) => manifests.push(manifest),
                    Err(err) => debug!(path = %entry.path().display(), %err, "skipping bad manifest"),
                },
                Err(err) => debug!(path = %entry.path().display(), %err, "skipping unreadable manifest"),
            }
        }
        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(manifests)
    }

    // === Files ===

    /// Chunk a file into the store and record its manifest.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn store_file(&self, path: &Path, chunk_size: usize) -> Result<FileManifest> {
        let manifest = create_manifest(path, chunk_size, "").await?;

        let mut file = fs::File::open(path).await?;
        let mut buf = vec![0u8; chunk_size];
        for chunk in &manifest.chunks {
            let n = read_chunk(&mut file, &mut buf).await?;
            if n as u64 != chunk.size {
                return Err(Error::Integrity(format!(
                    "file changed while being stored: {}",
                    path.display()
                )));
            }
            self.put_chunk(&chunk.hash, &buf[..n]).await?;
        }

        self.put_manifest(&manifest).await?;
        info!(info_hash = %&manifest.info_hash[..16], chunks = manifest.chunk_count(), "file stored");
        Ok(manifest)
    }

    /// Reassemble a file from its chunks, verifying the end-to-end hash.
    ///
    /// The output only becomes visible after verification succeeds; a
    /// missing chunk or hash mismatch leaves no partial file behind.
    #[instrument(skip(self, manifest), fields(info_hash = %&manifest.info_hash[..16]))]
    pub async fn reassemble(
        &self,
        manifest: &FileManifest,
        output: Option<&Path>,
    ) -> Result<PathBuf> {
        // A manifest name is untrusted input; only its file-name component
        // is used for the default output path.
        let default_name = Path::new(&manifest.name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&manifest.info_hash));
        let output = match output {
            Some(path) => path.to_path_buf(),
            None => self.files_dir.join(default_name),
        };

        let temp = self.temp_path(&manifest.info_hash);
        let result = self.write_verified(manifest, &temp).await;
        if let Err(err) = result {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&temp, &output).await?;
        info!(output = %output.display(), "file reassembled");
        Ok(output)
    }

    async fn write_verified(&self, manifest: &FileManifest, temp: &Path) -> Result<()> {
        let mut out = fs::File::create(temp).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;

        for chunk in &manifest.chunks {
            let data = self.get_chunk(&chunk.hash).await?;
            hasher.update(&data);
            written += data.len() as u64;
            out.write_all(&data).await?;
        }
        out.flush().await?;

        let actual = hex::encode(hasher.finalize());
        if actual != manifest.info_hash {
            return Err(Error::Integrity(format!(
                "reassembled content hashes to {actual}, manifest says {}",
                manifest.info_hash
            )));
        }
        if written != manifest.size {
            return Err(Error::Integrity(format!(
                "reassembled {written} bytes, manifest says {}",
                manifest.size
            )));
        }
        Ok(())
    }

    /// Chunk hashes of `manifest` we do not have yet, in index order.
    pub async fn missing_chunks(&self, manifest: &FileManifest) -> Vec<String> {
        let mut missing = Vec::new();
        for chunk in &manifest.chunks {
            if !self.has_chunk(&chunk.hash).await {
                missing.push(chunk.hash.clone());
            }
        }
        missing
    }

    /// Chunk hashes of `manifest` present locally, in index order.
    pub async fn available_chunks(&self, manifest: &FileManifest) -> Vec<String> {
        let mut available = Vec::new();
        for chunk in &manifest.chunks {
            if self.has_chunk(&chunk.hash).await {
                available.push(chunk.hash.clone());
            }
        }
        available
    }

    // === Maintenance ===

    /// Storage statistics.
    pub async fn stats(&self) -> Result<StoreStats> {
        let mut total_chunks = 0;
        let mut total_bytes = 0;
        let mut prefixes = fs::read_dir(&self.chunks_dir).await?;
        while let Some(prefix) = prefixes.next_entry().await? {
            if !prefix.file_type().await?.is_dir() {
                continue;
            }
            let mut chunks = fs::read_dir(prefix.path()).await?;
            while let Some(chunk) = chunks.next_entry().await? {
                total_chunks += 1;
                total_bytes += chunk.metadata().await?.len();
            }
        }

        let mut manifest_count = 0;
        let mut entries = fs::read_dir(&self.manifests_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().map(|e| e == "json") == Some(true) {
                manifest_count += 1;
            }
        }

        Ok(StoreStats {
            total_chunks,
            total_bytes,
            manifest_count,
        })
    }

    /// Delete chunks not referenced by any manifest (or by `keep`).
    /// Returns how many were removed.
    pub async fn cleanup_orphans(&self, keep: &HashSet<String>) -> Result<usize> {
        let mut referenced: HashSet<String> = keep.clone();
        for manifest in self.list_manifests().await? {
            for chunk in &manifest.chunks {
                referenced.insert(chunk.hash.clone());
            }
        }

        let mut removed = 0;
        let mut prefixes = fs::read_dir(&self.chunks_dir).await?;
        while let Some(prefix) = prefixes.next_entry().await? {
            if !prefix.file_type().await?.is_dir() {
                continue;
            }
            let mut chunks = fs::read_dir(prefix.path()).await?;
            while let Some(chunk) = chunks.next_entry().await? {
                let name = chunk.file_name().to_string_lossy().into_owned();
                if !referenced.contains(&name) {
                    fs::remove_file(chunk.path()).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::DEFAULT_CHUNK_SIZE;
    use std::io::Write;
    use tempfile::TempDir;

    async fn store() -> (TempDir, ChunkStore) {
        let dir = TempDir::new().expect("temp dir");
        let store = ChunkStore::open(dir.path()).await.expect("open");
        (dir, store)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8).collect()
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (_dir, store) = store().await;
        let data = payload(1000);
        let hash = sha256_hex(&data);

        store.put_chunk(&hash, &data).await.expect("put");
        assert!(store.has_chunk(&hash).await);
        assert_eq!(store.get_chunk(&hash).await.expect("get"), data);
    }

    #[tokio::test]
    async fn put_refuses_mismatched_hash() {
        let (_dir, store) = store().await;
        let err = store
            .put_chunk(&sha256_hex(b"expected"), b"different")
            .await
            .expect_err("hash mismatch");
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[tokio::test]
    async fn get_self_heals_corrupted_chunk() {
        let (_dir, store) = store().await;
        let data = payload(500);
        let hash = sha256_hex(&data);
        store.put_chunk(&hash, &data).await.expect("put");

        // Flip one byte on disk.
        let path = store.chunk_path(&hash).expect("path");
        let mut corrupted = std::fs::read(&path).expect("read");
        corrupted[0] ^= 0xFF;
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(&corrupted).expect("write");
        drop(file);

        let err = store.get_chunk(&hash).await.expect_err("corrupt");
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!store.has_chunk(&hash).await);
    }

    #[tokio::test]
    async fn bogus_hashes_never_touch_paths() {
        let (_dir, store) = store().await;
        let err = store
            .get_chunk("../../etc/passwd")
            .await
            .expect_err("rejected");
        assert!(matches!(err, Error::InvalidMessage(_)));
        assert!(!store.has_chunk("short").await);
    }

    #[tokio::test]
    async fn store_then_reassemble_is_identity() {
        let (dir, store) = store().await;
        let data = payload(700_000);
        let source = dir.path().join("source.bin");
        std::fs::write(&source, &data).expect("write source");

        let manifest = store
            .store_file(&source, DEFAULT_CHUNK_SIZE)
            .await
            .expect("store file");
        assert_eq!(manifest.chunk_count(), 3);
        assert!(store.missing_chunks(&manifest).await.is_empty());
        assert_eq!(store.available_chunks(&manifest).await.len(), 3);

        let out = store.reassemble(&manifest, None).await.expect("reassemble");
        assert_eq!(std::fs::read(&out).expect("read output"), data);
    }

    #[tokio::test]
    async fn reassemble_empty_file() {
        let (dir, store) = store().await;
        let source = dir.path().join("empty.bin");
        std::fs::write(&source, b"").expect("write");

        let manifest = store
            .store_file(&source, DEFAULT_CHUNK_SIZE)
            .await
            .expect("store");
        assert_eq!(manifest.chunk_count(), 0);

        let out = store.reassemble(&manifest, None).await.expect("reassemble");
        assert_eq!(std::fs::read(&out).expect("read").len(), 0);
    }

    #[tokio::test]
    async fn reassemble_fails_without_all_chunks() {
        let (dir, store) = store().await;
        let data = payload(600_000);
        let source = dir.path().join("source.bin");
        std::fs::write(&source, &data).expect("write");

        let manifest = store
            .store_file(&source, DEFAULT_CHUNK_SIZE)
            .await
            .expect("store");
        store
            .delete_chunk(&manifest.chunks[1].hash)
            .await
            .expect("delete");

        let out_path = dir.path().join("out.bin");
        let err = store
            .reassemble(&manifest, Some(&out_path))
            .await
            .expect_err("chunk missing");
        assert!(matches!(err, Error::NotFound(_)));
        // No partial output became visible.
        assert!(!out_path.exists());
    }

    #[tokio::test]
    async fn manifest_crud() {
        let (dir, store) = store().await;
        let source = dir.path().join("a.bin");
        std::fs::write(&source, payload(100)).expect("write");
        let manifest = store.store_file(&source, 64).await.expect("store");

        assert!(store.has_manifest(&manifest.info_hash).await);
        let loaded = store
            .get_manifest(&manifest.info_hash)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.info_hash, manifest.info_hash);
        assert_eq!(store.list_manifests().await.expect("list").len(), 1);

        assert!(store.delete_manifest(&manifest.info_hash).await.expect("delete"));
        assert!(store.get_manifest(&manifest.info_hash).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn orphan_cleanup_spares_referenced_chunks() {
        let (dir, store) = store().await;
        let source = dir.path().join("a.bin");
        std::fs::write(&source, payload(100)).expect("write");
        let manifest = store.store_file(&source, 64).await.expect("store");

        // An unreferenced chunk.
        let orphan = payload(33);
        let orphan_hash = sha256_hex(&orphan);
        store.put_chunk(&orphan_hash, &orphan).await.expect("put");

        let removed = store
            .cleanup_orphans(&HashSet::new())
            .await
            .expect("cleanup");
        assert_eq!(removed, 1);
        assert!(!store.has_chunk(&orphan_hash).await);
        assert!(store.missing_chunks(&manifest).await.is_empty());
    }

    #[tokio::test]
    async fn stats_count_chunks_and_manifests() {
        let (dir, store) = store().await;
        let source = dir.path().join("a.bin");
        std::fs::write(&source, payload(200)).expect("write");
        store.store_file(&source, 64).await.expect("store");

        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.total_chunks, 4);
        assert_eq!(stats.total_bytes, 200);
        assert_eq!(stats.manifest_count, 1);
    }
}
