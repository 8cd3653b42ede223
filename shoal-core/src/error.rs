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


//! Error types shared across the node.
//!
//! The downloader's retry policy depends on telling transient peer failures
//! (`Timeout`, `PeerUnreachable`, per-chunk `Integrity`) apart from terminal
//! ones (`NotFound` after all alternates are exhausted, `Io` on the local
//! store), so the variants here mirror that split rather than wrapping
//! everything in one opaque error.

use std::net::SocketAddr;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the core subsystems.
#[derive(Debug, Error)]
pub enum Error {
    /// A manifest, chunk, value or peer set could not be located.
    #[error("not found: {0}")]
    NotFound(String),

    /// Content failed hash verification (chunk, reassembled file or manifest).
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// A request did not complete within its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A peer could not be reached at all.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(SocketAddr),

    /// Malformed framing, oversize message or unparsable JSON.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The node is shutting down or the caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Filesystem failure in the chunk store.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidMessage(err.to_string())
    }
}

impl Error {
    /// True for failures that the downloader retries against alternate peers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::PeerUnreachable(_) | Error::Integrity(_)
        )
    }
}
