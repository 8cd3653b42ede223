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


//! Share and download history.
//!
//! A JSON sidecar file next to the node's data directory, loaded at
//! startup and rewritten on every mutation. Bookkeeping only: the core
//! never reads it.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use shoal_core::FileManifest;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRecord {
    pub info_hash: String,
    pub name: String,
    pub size: u64,
    pub shared_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub info_hash: String,
    pub outcome: String,
    pub finished_at: i64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(default)]
    shares: Vec<ShareRecord>,
    #[serde(default)]
    downloads: Vec<DownloadRecord>,
}

/// Persistent share/download history.
pub struct History {
    path: PathBuf,
    entries: RwLock<HistoryFile>,
}

impl History {
    /// Load existing history, or start empty.
    pub async fn load(path: PathBuf) -> Self {
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(%err, "history file unreadable, starting fresh");
                    HistoryFile::default()
                }
            },
            Err(_) => HistoryFile::default(),
        };
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    async fn save(&self) -> Result<()> {
        let entries = self.entries.read().await;
        let json = serde_json::to_string_pretty(&*entries)?;
        drop(entries);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await?;
        debug!(path = %self.path.display(), "history saved");
        Ok(())
    }

    /// Record a shared file.
    pub async fn record_share(&self, manifest: &FileManifest) {
        {
            let mut entries = self.entries.write().await;
            entries.shares.retain(|s| s.info_hash != manifest.info_hash);
            entries.shares.push(ShareRecord {
                info_hash: manifest.info_hash.clone(),
                name: manifest.name.clone(),
                size: manifest.size,
                shared_at: Utc::now().timestamp(),
            });
        }
        if let Err(err) = self.save().await {
            warn!(%err, "failed to save history");
        }
    }

    /// Record a finished download attempt.
    pub async fn record_download(&self, info_hash: &str, outcome: &str) {
        {
            let mut entries = self.entries.write().await;
            entries.downloads.push(DownloadRecord {
                info_hash: info_hash.to_string(),
                outcome: outcome.to_string(),
                finished_at: Utc::now().timestamp(),
            });
        }
        if let Err(err) = self.save().await {
            warn!(%err, "failed to save history");
        }
    }

    /// All share records.
    pub async fn shares(&self) -> Vec<ShareRecord> {
        self.entries.read().await.shares.clone()
    }

    /// All download records.
    pub async fn downloads(&self) -> Vec<DownloadRecord> {
        self.entries.read().await.downloads.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest() -> FileManifest {
        FileManifest {
            name: "a.bin".into(),
            size: 42,
            info_hash: "ab".repeat(32),
            chunk_size: 262_144,
            chunks: Vec::new(),
            created_at: 0.0,
            created_by: String::new(),
            mime_type: String::new(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn history_survives_reload() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("history.json");

        let history = History::load(path.clone()).await;
        history.record_share(&manifest()).await;
        history.record_download(&"ab".repeat(32), "complete").await;

        let reloaded = History::load(path).await;
        assert_eq!(reloaded.shares().await.len(), 1);
        assert_eq!(reloaded.downloads().await.len(), 1);
        assert_eq!(reloaded.downloads().await[0].outcome, "complete");
    }

    #[tokio::test]
    async fn sharing_twice_keeps_one_record() {
        let dir = TempDir::new().expect("temp dir");
        let history = History::load(dir.path().join("history.json")).await;
        history.record_share(&manifest()).await;
        history.record_share(&manifest()).await;
        assert_eq!(history.shares().await.len(), 1);
    }
}
