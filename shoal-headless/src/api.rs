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


//! HTTP control surface.
//!
//! JSON API over warp. Downloads run in the background; their progress
//! snapshots fan out through a broadcast channel per info hash and stream
//! to clients as server-sent events.

use serde::Deserialize;
use serde_json::json;
use shoal_core::transfer::{DownloadProgress, ProgressSink};
use shoal_core::Node;
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::history::History;

/// Shared state behind every route.
pub struct ApiState {
    pub node: Arc<Node>,
    pub history: Arc<History>,
    /// Live progress channels keyed by info hash.
    pub downloads: Mutex<HashMap<String, broadcast::Sender<DownloadProgress>>>,
}

#[derive(Debug, Deserialize)]
struct ShareRequest {
    path: PathBuf,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    info_hash: String,
    #[serde(default)]
    output: Option<PathBuf>,
}

fn with_state(
    state: Arc<ApiState>,
) -> impl Filter<Extract = (Arc<ApiState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn error_reply(
    status: StatusCode,
    message: impl std::fmt::Display,
) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(
        warp::reply::json(&json!({ "error": message.to_string() })),
        status,
    )
}

fn ok_reply(value: &impl serde::Serialize) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(value), StatusCode::OK)
}

/// Build the full route tree.
pub fn routes(
    state: Arc<ApiState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let status = warp::path!("api" / "status")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(status_handler);

    let files = warp::path!("api" / "files")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(files_handler);

    let remove = warp::path!("api" / "files" / String)
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(remove_handler);

    let share = warp::path!("api" / "share")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(share_handler);

    let download = warp::path!("api" / "download")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(download_handler);

    let events = warp::path!("api" / "downloads" / String / "events")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(events_handler);

    let peers = warp::path!("api" / "peers")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(peers_handler);

    let history = warp::path!("api" / "history")
        .and(warp::get())
        .and(with_state(state))
        .and_then(history_handler);

    status
        .or(files)
        .or(remove)
        .or(share)
        .or(download)
        .or(events)
        .or(peers)
        .or(history)
}

async fn status_handler(state: Arc<ApiState>) -> Result<impl warp::Reply, warp::Rejection> {
    match state.node.stats().await {
        Ok(stats) => Ok(ok_reply(&stats)),
        Err(err) => Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, err)),
    }
}

async fn files_handler(state: Arc<ApiState>) -> Result<impl warp::Reply, warp::Rejection> {
    match state.node.list_files().await {
        Ok(manifests) => Ok(ok_reply(&manifests)),
        Err(err) => Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, err)),
    }
}

async fn remove_handler(
    info_hash: String,
    state: Arc<ApiState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    match state.node.remove_file(&info_hash).await {
        Ok(true) => Ok(ok_reply(&json!({ "removed": info_hash }))),
        Ok(false) => Ok(error_reply(StatusCode::NOT_FOUND, "not shared")),
        Err(err) => Ok(error_reply(StatusCode::BAD_REQUEST, err)),
    }
}

async fn share_handler(
    request: ShareRequest,
    state: Arc<ApiState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    match state.node.share(&request.path, &request.description).await {
        Ok(manifest) => {
            state.history.record_share(&manifest).await;
            Ok(ok_reply(&manifest))
        }
        Err(err) => Ok(error_reply(StatusCode::BAD_REQUEST, err)),
    }
}

async fn download_handler(
    request: DownloadRequest,
    state: Arc<ApiState>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let info_hash = request.info_hash.clone();
    let (tx, _) = broadcast::channel(64);
    state
        .downloads
        .lock()
        .await
        .insert(info_hash.clone(), tx.clone());

    let task_state = state.clone();
    tokio::spawn(async move {
        let sink_tx = tx.clone();
        let sink: ProgressSink = Arc::new(move |progress: &DownloadProgress| {
            let _ = sink_tx.send(progress.clone());
        });
        let outcome = task_state
            .node
            .download(&request.info_hash, request.output.as_deref(), Some(sink))
            .await;
        let label = match &outcome {
            Ok(path) => {
                info!(path = %path.display(), "download finished");
                "complete"
            }
            Err(_) => "failed",
        };
        task_state
            .history
            .record_download(&request.info_hash, label)
            .await;
    });

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "status": "started", "info_hash": info_hash })),
        StatusCode::ACCEPTED,
    ))
}

async fn events_handler(
    info_hash: String,
    state: Arc<ApiState>,
) -> Result<warp::reply::Response, warp::Rejection> {
    let receiver = state
        .downloads
        .lock()
        .await
        .get(&info_hash)
        .map(|tx| tx.subscribe());

    match receiver {
        Some(receiver) => {
            let stream = BroadcastStream::new(receiver).filter_map(|item| {
                item.ok()
                    .and_then(|progress| warp::sse::Event::default().json_data(&progress).ok())
                    .map(Ok::<_, Infallible>)
            });
            Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)).into_response())
        }
        None => Ok(error_reply(
            StatusCode::NOT_FOUND,
            "no active download for this info hash",
        )
        .into_response()),
    }
}

async fn peers_handler(state: Arc<ApiState>) -> Result<impl warp::Reply, warp::Rejection> {
    Ok(ok_reply(&state.node.lan_peers().await))
}

async fn history_handler(state: Arc<ApiState>) -> Result<impl warp::Reply, warp::Rejection> {
    Ok(ok_reply(&json!({
        "shares": state.history.shares().await,
        "downloads": state.history.downloads().await,
    })))
}
