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


//! Shoal - P2P file sharing over a Kademlia DHT.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shoal_core::transfer::DownloadProgress;
use shoal_core::{Node, NodeConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Debug, Parser)]
#[command(name = "shoal", version, about = "P2P file sharing over a Kademlia DHT", long_about = None)]
struct Args {
    /// Data directory for chunks, manifests and downloads
    #[arg(long, default_value = "./shoal_data")]
    data_dir: PathBuf,

    /// Address to bind listeners on
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// DHT UDP port
    #[arg(long, default_value_t = 8468)]
    dht_port: u16,

    /// File transfer TCP port
    #[arg(long, default_value_t = 8469)]
    transfer_port: u16,

    /// Bootstrap node (host:port), may be repeated
    #[arg(short, long)]
    bootstrap: Vec<SocketAddr>,

    /// Disable LAN broadcast discovery
    #[arg(long)]
    no_discovery: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a node until interrupted
    Start,
    /// Share a file and keep serving it
    Share {
        /// File to share
        file: PathBuf,
        /// Optional description stored in the manifest
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Download a file by info hash
    Download {
        /// SHA-256 info hash (64 hex characters)
        info_hash: String,
        /// Output path (defaults to the data directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List locally shared files
    List,
    /// Stop sharing a file
    Remove {
        /// Info hash of the file to remove
        info_hash: String,
    },
    /// Show peers discovered on the LAN
    Peers,
    /// Show node statistics
    Status,
}

fn node_config(args: &Args) -> NodeConfig {
    NodeConfig {
        host: args.host,
        dht_port: args.dht_port,
        transfer_port: args.transfer_port,
        data_dir: args.data_dir.clone(),
        bootstrap_nodes: args.bootstrap.clone(),
        auto_discover: !args.no_discovery,
        ..NodeConfig::default()
    }
}

fn render_progress(progress: &DownloadProgress) {
    // Carriage-return progress line; details land in the final summary.
    eprint!(
        "\r[{:?}] {}/{} chunks, {} bytes    ",
        progress.phase, progress.downloaded_chunks, progress.total_chunks, progress.bytes_downloaded
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "shoal=debug,shoal_core=debug"
    } else {
        "shoal=info,shoal_core=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    match &args.command {
        Command::Start => {
            let node = Node::start(node_config(&args)).await?;
            println!("Node {} running", node.node_id());
            println!("  DHT:      {}", node.dht_addr());
            println!("  Transfer: {}", node.transfer_addr());
            signal::ctrl_c().await.context("waiting for ctrl-c")?;
            node.stop().await;
        }

        Command::Share { file, description } => {
            let node = Node::start(node_config(&args)).await?;
            let manifest = node
                .share(file, description)
                .await
                .with_context(|| format!("sharing {}", file.display()))?;
            println!("Shared {} ({} bytes, {} chunks)", manifest.name, manifest.size, manifest.chunk_count());
            println!("info_hash: {}", manifest.info_hash);
            println!("Serving until interrupted...");
            signal::ctrl_c().await.context("waiting for ctrl-c")?;
            node.stop().await;
        }

        Command::Download { info_hash, output } => {
            let node = Node::start(node_config(&args)).await?;
            let path = node
                .download(
                    info_hash,
                    output.as_deref(),
                    Some(Arc::new(render_progress)),
                )
                .await
                .context("download failed")?;
            eprintln!();
            println!("Saved to {}", path.display());
            node.stop().await;
        }

        Command::List => {
            let mut config = node_config(&args);
            config.auto_discover = false;
            let node = Node::start(config).await?;
            let manifests = node.list_files().await?;
            if manifests.is_empty() {
                println!("No shared files");
            }
            for manifest in manifests {
                println!(
                    "{}  {:>12} bytes  {}",
                    manifest.info_hash, manifest.size, manifest.name
                );
            }
            node.stop().await;
        }

        Command::Remove { info_hash } => {
            let mut config = node_config(&args);
            config.auto_discover = false;
            let node = Node::start(config).await?;
            if node.remove_file(info_hash).await? {
                println!("Removed {info_hash}");
            } else {
                println!("Not shared: {info_hash}");
            }
            node.stop().await;
        }

        Command::Peers => {
            let node = Node::start(node_config(&args)).await?;
            let peers = node.lan_peers().await;
            if peers.is_empty() {
                println!("No LAN peers discovered");
            }
            for peer in peers {
                println!(
                    "{}  dht {}:{}  transfer {}:{}",
                    peer.node_id, peer.ip, peer.dht_port, peer.ip, peer.transfer_port
                );
            }
            node.stop().await;
        }

        Command::Status => {
            let node = Node::start(node_config(&args)).await?;
            let stats = node.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            node.stop().await;
        }
    }

    Ok(())
}
