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


//! UDP request/response plumbing for the DHT.
//!
//! Outgoing requests are correlated with responses through the pending map:
//! an entry is inserted before the datagram leaves, and completed either by
//! a response echoing the message id, by the periodic sweep once it is older
//! than the request timeout, or with `Cancelled` at shutdown. Responses for
//! ids that already completed are ignored.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, trace};

use super::protocol::{Message, MessageId};
use crate::error::{Error, Result};

/// Largest datagram we will receive. UDP cannot carry more anyway.
pub const MAX_DATAGRAM: usize = 65_535;

struct PendingRequest {
    tx: oneshot::Sender<Result<Message>>,
    sent_at: Instant,
}

/// A bound UDP endpoint with request/response correlation.
pub struct DhtTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    pending: Mutex<HashMap<MessageId, PendingRequest>>,
}

impl DhtTransport {
    /// Bind the endpoint. Port 0 picks an ephemeral port.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// The address the socket actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fire-and-forget send (responses, unsolicited messages).
    pub async fn send(&self, message: &Message, addr: SocketAddr) -> Result<()> {
        let data = message.encode()?;
        self.socket.send_to(&data, addr).await?;
        trace!(kind = message.body.kind(), %addr, "sent datagram");
        Ok(())
    }

    /// Send a request and wait for the matching response.
    ///
    /// The pending entry is registered before the send so a fast responder
    /// cannot race the bookkeeping.
    pub async fn send_request(
        &self,
        message: Message,
        addr: SocketAddr,
        timeout: std::time::Duration,
    ) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        let id = message.message_id;
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                id,
                PendingRequest {
                    tx,
                    sent_at: Instant::now(),
                },
            );
        }

        if let Err(err) = self.send(&message, addr).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped: the node is shutting down.
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout(format!("request to {addr}")))
            }
        }
    }

    /// Receive one datagram.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (len, addr) = self.socket.recv_from(buf).await?;
        Ok((len, addr))
    }

    /// If `message` answers a pending request, complete it and return `None`;
    /// otherwise hand the message back for request dispatch.
    pub async fn route_response(&self, message: Message) -> Option<Message> {
        let mut pending = self.pending.lock().await;
        if let Some(entry) = pending.remove(&message.message_id) {
            // A closed receiver just means the caller gave up; drop silently.
            let _ = entry.tx.send(Ok(message));
            None
        } else {
            Some(message)
        }
    }

    /// Complete every pending request older than `timeout` with a timeout
    /// error. Called by the sweep task once per second.
    pub async fn expire_pending(&self, timeout: std::time::Duration) {
        let mut pending = self.pending.lock().await;
        let now = Instant::now();
        let expired: Vec<MessageId> = pending
            .iter()
            .filter(|(_, req)| now.duration_since(req.sent_at) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = pending.remove(&id) {
                debug!(id = %id.to_hex(), "request expired");
                let _ = entry.tx.send(Err(Error::Timeout("swept pending request".into())));
            }
        }
    }

    /// Fail every pending request with `Cancelled`. Called at shutdown.
    pub async fn cancel_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            let _ = entry.tx.send(Err(Error::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::NodeId;
    use crate::dht::protocol::MessageBody;
    use std::time::Duration;

    async fn loopback() -> DhtTransport {
        DhtTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind")
    }

    #[tokio::test]
    async fn request_times_out_without_response() {
        let a = loopback().await;
        let b = loopback().await;
        let msg = Message::request(NodeId::random(), MessageBody::Ping {});
        let err = a
            .send_request(msg, b.local_addr(), Duration::from_millis(100))
            .await
            .expect_err("no one answers");
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn response_completes_pending_request() {
        let a = loopback().await;
        let b = loopback().await;
        let b_id = NodeId::random();

        let request = Message::request(NodeId::random(), MessageBody::Ping {});
        let request_id = request.message_id;

        let b_addr = b.local_addr();
        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let (len, from) = b.recv(&mut buf).await.expect("recv");
            let incoming = Message::decode(&buf[..len]).expect("decode");
            let reply = Message::response(b_id, incoming.message_id, MessageBody::Pong {});
            b.send(&reply, from).await.expect("send reply");
        });

        let a = std::sync::Arc::new(a);
        let pump = {
            let a = a.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                let (len, _) = a.recv(&mut buf).await.expect("recv");
                let msg = Message::decode(&buf[..len]).expect("decode");
                assert!(a.route_response(msg).await.is_none());
            })
        };

        let response = a
            .send_request(request, b_addr, Duration::from_secs(2))
            .await
            .expect("response arrives");
        assert_eq!(response.message_id, request_id);
        assert!(matches!(response.body, MessageBody::Pong {}));

        responder.await.expect("responder");
        pump.await.expect("pump");
    }

    #[tokio::test]
    async fn sweep_expires_old_entries() {
        let a = loopback().await;
        let b = loopback().await;
        let msg = Message::request(NodeId::random(), MessageBody::Ping {});

        let a = std::sync::Arc::new(a);
        let sweeper = {
            let a = a.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                a.expire_pending(Duration::from_millis(10)).await;
            })
        };

        let err = a
            .send_request(msg, b.local_addr(), Duration::from_secs(5))
            .await
            .expect_err("swept before the 5s deadline");
        assert!(matches!(err, Error::Timeout(_)));
        sweeper.await.expect("sweeper");
    }

    #[tokio::test]
    async fn unsolicited_message_is_handed_back() {
        let a = loopback().await;
        let msg = Message::request(NodeId::random(), MessageBody::Ping {});
        assert!(a.route_response(msg).await.is_some());
    }
}
