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


//! Shoal headless node: a long-running daemon exposing the node over an
//! HTTP JSON API with a server-sent-events progress stream.

mod api;
mod history;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use shoal_core::{Node, NodeConfig};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::history::History;

#[derive(Debug, Parser)]
#[command(
    name = "shoal-headless",
    author,
    version,
    about = "Headless Shoal P2P file-sharing node",
    long_about = None
)]
struct Args {
    /// Configuration file path (created with defaults if missing)
    #[arg(short, long, default_value = "./shoal.toml")]
    config: PathBuf,

    /// Override the storage directory
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Override the HTTP API listen address
    #[arg(long)]
    api: Option<SocketAddr>,

    /// Additional bootstrap nodes (host:port)
    #[arg(short, long)]
    bootstrap: Vec<SocketAddr>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Config {
    /// Seed nodes joined at startup
    bootstrap_nodes: Vec<SocketAddr>,
    network: NetworkConfig,
    storage: StorageConfig,
    api: ApiConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct NetworkConfig {
    host: IpAddr,
    dht_port: u16,
    transfer_port: u16,
    auto_discover: bool,
    discovery_port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiConfig {
    listen: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            network: NetworkConfig {
                host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                dht_port: 8468,
                transfer_port: 8469,
                auto_discover: true,
                discovery_port: 8470,
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("./shoal_data"),
            },
            api: ApiConfig {
                listen: "127.0.0.1:8080".parse().expect("valid default"),
            },
        }
    }
}

async fn load_or_create_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .context("failed to read config file")?;
        toml::from_str(&content).context("failed to parse config file")
    } else {
        let config = Config::default();
        let content = toml::to_string_pretty(&config).context("failed to serialize config")?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content)
            .await
            .context("failed to write default config")?;
        info!(path = %path.display(), "wrote default configuration");
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shoal_headless=info,shoal_core=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = load_or_create_config(&args.config).await?;
    if let Some(storage) = args.storage {
        config.storage.data_dir = storage;
    }
    if let Some(api) = args.api {
        config.api.listen = api;
    }
    config.bootstrap_nodes.extend(args.bootstrap);

    let node_config = NodeConfig {
        host: config.network.host,
        dht_port: config.network.dht_port,
        transfer_port: config.network.transfer_port,
        data_dir: config.storage.data_dir.clone(),
        bootstrap_nodes: config.bootstrap_nodes.clone(),
        auto_discover: config.network.auto_discover,
        discovery_port: config.network.discovery_port,
        ..NodeConfig::default()
    };

    let node = Node::start(node_config).await.context("starting node")?;
    info!(
        id = %node.node_id(),
        dht = %node.dht_addr(),
        transfer = %node.transfer_addr(),
        "headless node running"
    );

    let history = Arc::new(History::load(config.storage.data_dir.join("history.json")).await);
    let state = Arc::new(ApiState {
        node: node.clone(),
        history,
        downloads: Mutex::new(HashMap::new()),
    });

    let routes = api::routes(state);
    let api_addr = config.api.listen;
    info!(%api_addr, "HTTP API listening");

    tokio::select! {
        _ = warp::serve(routes).run(api_addr) => {
            warn!("API server exited");
        }
        result = signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("shutting down");
        }
    }

    node.stop().await;
    Ok(())
}
