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


//! Peer-to-peer chunk transfer.
//!
//! A length-framed TCP protocol moves chunks and manifests between peers;
//! the pooled client serializes requests per connection, the server runs a
//! request loop per accepted connection, and the downloader swarms chunk
//! fetches across every available peer.

pub mod client;
pub mod downloader;
pub mod protocol;
pub mod server;

pub use client::TransferClient;
pub use downloader::{
    ChunkProgress, ChunkStatus, DownloadPhase, DownloadProgress, FileDownloader, PeerProgress,
    ProgressSink,
};
pub use protocol::{MAX_MESSAGE_SIZE, TransferMessage};
pub use server::{TransferServer, UploadStats};
