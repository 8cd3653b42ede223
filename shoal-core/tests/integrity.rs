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


//! Integrity enforcement against misbehaving peers: altered chunk bodies
//! are refused, retried on alternates, and fail the download only when no
//! honest peer remains.

use shoal_core::chunk_store::ChunkStore;
use shoal_core::transfer::{
    DownloadPhase, FileDownloader, TransferClient, TransferMessage, TransferServer,
};
use shoal_core::{DownloadProgress, Error};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// A peer that serves correct-length but corrupted chunk bodies.
async fn spawn_malicious_peer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                while let Ok(Some(message)) = TransferMessage::read_from(&mut stream).await {
                    let reply = match message {
                        TransferMessage::RequestChunk { hash } => TransferMessage::ChunkData {
                            hash,
                            // Plausible length, wrong bytes.
                            data: vec![0x5a; 1024],
                        },
                        TransferMessage::RequestManifest { info_hash } => {
                            TransferMessage::ManifestNotFound { info_hash }
                        }
                        TransferMessage::Ping => TransferMessage::Pong,
                        _ => continue,
                    };
                    if reply.write_to(&mut stream).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

fn client() -> Arc<TransferClient> {
    Arc::new(TransferClient::new(
        Duration::from_secs(2),
        Duration::from_secs(5),
        Duration::from_secs(5),
    ))
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

#[tokio::test]
async fn altered_chunks_are_retried_on_honest_peer() {
    let dir = TempDir::new().expect("temp dir");

    // Honest seeder.
    let seeder_store = Arc::new(
        ChunkStore::open(dir.path().join("seeder"))
            .await
            .expect("open seeder store"),
    );
    let data = payload(600_000);
    let source = dir.path().join("file.bin");
    std::fs::write(&source, &data).expect("write");
    let manifest = seeder_store
        .store_file(&source, 256 * 1024)
        .await
        .expect("seed");
    let honest = TransferServer::start(seeder_store, "127.0.0.1:0".parse().expect("addr"))
        .await
        .expect("server");

    let malicious = spawn_malicious_peer().await;

    let local_store = Arc::new(
        ChunkStore::open(dir.path().join("local"))
            .await
            .expect("open local store"),
    );
    let downloader = FileDownloader::new(local_store.clone(), client(), 5);

    let out = dir.path().join("out.bin");
    let snapshots: Arc<Mutex<Vec<DownloadProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_snapshots = snapshots.clone();
    let path = downloader
        .download(
            &manifest,
            &[malicious, honest.local_addr()],
            Some(Arc::new(move |p: &DownloadProgress| {
                sink_snapshots.lock().expect("lock").push(p.clone());
            })),
            Some(&out),
        )
        .await
        .expect("honest peer rescues the download");

    assert_eq!(std::fs::read(&path).expect("read"), data);

    // The malicious peer got blamed for at least one failed chunk.
    let snapshots = snapshots.lock().expect("lock");
    let last = snapshots.last().expect("progress");
    assert_eq!(last.phase, DownloadPhase::Complete);
    let failures: usize = last.peers.values().map(|p| p.chunks_failed).sum();
    assert!(failures >= 1, "corrupted bodies must count as failures");

    honest.stop().await;
}

#[tokio::test]
async fn download_fails_when_no_honest_peer_remains() {
    let dir = TempDir::new().expect("temp dir");

    // Build a manifest locally, then delete the chunks so they must come
    // from the network.
    let store = Arc::new(ChunkStore::open(dir.path().join("store")).await.expect("open"));
    let data = payload(300_000);
    let source = dir.path().join("file.bin");
    std::fs::write(&source, &data).expect("write");
    let manifest = store.store_file(&source, 256 * 1024).await.expect("store");
    for chunk in &manifest.chunks {
        store.delete_chunk(&chunk.hash).await.expect("delete");
    }

    let malicious = spawn_malicious_peer().await;
    let downloader = FileDownloader::new(store.clone(), client(), 5);

    let err = downloader
        .download(&manifest, &[malicious], None, None)
        .await
        .expect_err("only altered bytes on offer");
    assert!(matches!(err, Error::NotFound(_)));

    // Nothing bogus was stored.
    assert_eq!(store.missing_chunks(&manifest).await.len(), manifest.chunk_count());
}

#[tokio::test]
async fn corrupted_chunk_is_never_stored() {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(ChunkStore::open(dir.path()).await.expect("open"));

    let err = store
        .put_chunk(&"0".repeat(64), b"whatever")
        .await
        .expect_err("hash mismatch");
    assert!(matches!(err, Error::Integrity(_)));
}
