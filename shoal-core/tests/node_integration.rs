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


//! End-to-end node tests over loopback: share/download between real nodes,
//! swarming across two seeders, and progress reporting.

use shoal_core::transfer::{ChunkStatus, DownloadPhase, DownloadProgress};
use shoal_core::{Node, NodeConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn test_config(data_dir: &Path, bootstrap: Vec<SocketAddr>) -> NodeConfig {
    NodeConfig {
        host: "127.0.0.1".parse().expect("addr"),
        dht_port: 0,
        transfer_port: 0,
        data_dir: data_dir.to_path_buf(),
        bootstrap_nodes: bootstrap,
        auto_discover: false,
        ..NodeConfig::default()
    }
}

fn pseudo_random_payload(len: usize) -> Vec<u8> {
    // Deterministic but non-repeating content so chunk hashes differ.
    let mut state = 0x2545f491u64;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

fn progress_recorder() -> (Arc<Mutex<Vec<DownloadProgress>>>, shoal_core::ProgressSink) {
    let snapshots: Arc<Mutex<Vec<DownloadProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_snapshots = snapshots.clone();
    let sink: shoal_core::ProgressSink = Arc::new(move |progress: &DownloadProgress| {
        sink_snapshots
            .lock()
            .expect("recorder lock")
            .push(progress.clone());
    });
    (snapshots, sink)
}

#[tokio::test]
async fn share_then_download_on_same_node_is_identity() {
    let dir = TempDir::new().expect("temp dir");
    let node = Node::start(test_config(&dir.path().join("node"), Vec::new()))
        .await
        .expect("start");

    let payload = pseudo_random_payload(300_000);
    let source = dir.path().join("local.bin");
    std::fs::write(&source, &payload).expect("write source");

    let manifest = node.share(&source, "local round trip").await.expect("share");

    let out = dir.path().join("out.bin");
    let path = node
        .download(&manifest.info_hash, Some(&out), None)
        .await
        .expect("download");
    assert_eq!(std::fs::read(&path).expect("read output"), payload);

    node.stop().await;
}

#[tokio::test]
async fn download_from_remote_peer() {
    let dir = TempDir::new().expect("temp dir");

    let seeder = Node::start(test_config(&dir.path().join("seeder"), Vec::new()))
        .await
        .expect("start seeder");

    // 700_000 bytes at the default 256 KiB chunk size: 3 chunks, last short.
    let payload = pseudo_random_payload(700_000);
    let source = dir.path().join("movie.bin");
    std::fs::write(&source, &payload).expect("write source");
    let manifest = seeder.share(&source, "").await.expect("share");
    assert_eq!(manifest.chunk_count(), 3);

    let downloader = Node::start(test_config(
        &dir.path().join("downloader"),
        vec![seeder.dht_addr()],
    ))
    .await
    .expect("start downloader");

    let (snapshots, sink) = progress_recorder();
    let out = dir.path().join("fetched.bin");
    let path = downloader
        .download(&manifest.info_hash, Some(&out), Some(sink))
        .await
        .expect("download");

    assert_eq!(std::fs::read(&path).expect("read output"), payload);

    let snapshots = snapshots.lock().expect("recorder lock");
    let last = snapshots.last().expect("progress was emitted");
    assert_eq!(last.phase, DownloadPhase::Complete);
    assert_eq!(last.total_chunks, 3);
    assert_eq!(last.downloaded_chunks, 3);
    assert_eq!(last.failed_chunks, 0);
    assert!(last.chunks.values().all(|c| c.status == ChunkStatus::Complete));

    // Each chunk went through a downloading then complete transition.
    for chunk in manifest.chunks.iter() {
        assert!(
            snapshots.iter().any(|p| p
                .chunks
                .get(&chunk.hash)
                .is_some_and(|c| c.status == ChunkStatus::Downloading)),
            "chunk {} never reported downloading",
            chunk.index
        );
    }

    // Merging was observed before completion.
    assert!(snapshots.iter().any(|p| p.phase == DownloadPhase::Merging));

    seeder.stop().await;
    downloader.stop().await;
}

#[tokio::test]
async fn swarm_spreads_chunks_across_seeders() {
    let dir = TempDir::new().expect("temp dir");

    let seeder_a = Node::start(test_config(&dir.path().join("a"), Vec::new()))
        .await
        .expect("start a");
    let seeder_b = Node::start(test_config(
        &dir.path().join("b"),
        vec![seeder_a.dht_addr()],
    ))
    .await
    .expect("start b");

    let payload = pseudo_random_payload(700_000);
    let source_a = dir.path().join("a.bin");
    let source_b = dir.path().join("b.bin");
    std::fs::write(&source_a, &payload).expect("write a");
    std::fs::write(&source_b, &payload).expect("write b");

    let manifest = seeder_a.share(&source_a, "").await.expect("share a");
    let manifest_b = seeder_b.share(&source_b, "").await.expect("share b");
    assert_eq!(manifest.info_hash, manifest_b.info_hash);

    let downloader = Node::start(test_config(
        &dir.path().join("d"),
        vec![seeder_a.dht_addr(), seeder_b.dht_addr()],
    ))
    .await
    .expect("start downloader");

    let (snapshots, sink) = progress_recorder();
    let out = dir.path().join("out.bin");
    downloader
        .download(&manifest.info_hash, Some(&out), Some(sink))
        .await
        .expect("download");
    assert_eq!(std::fs::read(&out).expect("read output"), payload);

    let snapshots = snapshots.lock().expect("recorder lock");
    let last = snapshots.last().expect("progress was emitted");
    assert_eq!(last.phase, DownloadPhase::Complete);

    // Both seeders took part: round-robin assignment splits 3 chunks 2/1
    // over 2 peers regardless of shuffle order.
    assert_eq!(last.peers.len(), 2);
    let mut assigned: Vec<usize> = last.peers.values().map(|p| p.chunks_assigned).collect();
    assigned.sort();
    assert_eq!(assigned, vec![1, 2]);

    // Every chunk completed and came from exactly one peer.
    assert!(last.chunks.values().all(|c| c.status == ChunkStatus::Complete));
    let completed: usize = last.peers.values().map(|p| p.chunks_completed).sum();
    assert_eq!(completed, 3);

    seeder_a.stop().await;
    seeder_b.stop().await;
    downloader.stop().await;
}

#[tokio::test]
async fn download_unknown_info_hash_is_not_found() {
    let dir = TempDir::new().expect("temp dir");
    let node = Node::start(test_config(&dir.path().join("n"), Vec::new()))
        .await
        .expect("start");

    let bogus = "ab".repeat(32);
    let err = node
        .download(&bogus, None, None)
        .await
        .expect_err("nobody has this");
    assert!(matches!(err, shoal_core::Error::NotFound(_)));

    node.stop().await;
}

#[tokio::test]
async fn empty_file_round_trips() {
    let dir = TempDir::new().expect("temp dir");
    let seeder = Node::start(test_config(&dir.path().join("s"), Vec::new()))
        .await
        .expect("start seeder");

    let source = dir.path().join("empty.bin");
    std::fs::write(&source, b"").expect("write");
    let manifest = seeder.share(&source, "").await.expect("share");
    assert_eq!(manifest.chunk_count(), 0);

    let downloader = Node::start(test_config(
        &dir.path().join("d"),
        vec![seeder.dht_addr()],
    ))
    .await
    .expect("start downloader");

    let out = dir.path().join("empty_out.bin");
    downloader
        .download(&manifest.info_hash, Some(&out), None)
        .await
        .expect("download");
    assert_eq!(std::fs::read(&out).expect("read").len(), 0);

    seeder.stop().await;
    downloader.stop().await;
}
