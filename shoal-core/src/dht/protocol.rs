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


//! DHT wire messages.
//!
//! One UTF-8 JSON object per UDP datagram:
//!
//! ```json
//! {"type": "FIND_NODE", "sender_id": "<hex40>", "message_id": "<hex16>",
//!  "payload": {"target_id": "<hex40>"}}
//! ```
//!
//! Responses echo the request's `message_id`. Unknown fields are ignored;
//! datagrams with unknown types fail to parse and are dropped by the
//! receive loop.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::{NodeContact, NodeId};
use crate::error::{Error, Result};

/// Random 64-bit request correlation id, encoded as 16 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 8]);

impl MessageId {
    /// Fresh random id for an outgoing request.
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Hex form used on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 16-character hex form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 8] = raw.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl Serialize for MessageId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex_str = String::deserialize(deserializer)?;
        MessageId::from_hex(&hex_str)
            .ok_or_else(|| serde::de::Error::custom("message id must be 16 hex characters"))
    }
}

/// Contact information as it travels in FIND_NODE / FIND_VALUE responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node_id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
}

impl From<&NodeContact> for NodeEntry {
    fn from(contact: &NodeContact) -> Self {
        Self {
            node_id: contact.node_id,
            ip: contact.ip,
            port: contact.port,
        }
    }
}

impl From<NodeEntry> for NodeContact {
    fn from(entry: NodeEntry) -> Self {
        NodeContact::new(entry.node_id, entry.ip, entry.port)
    }
}

/// A transfer endpoint of a peer that announced a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PeerEntry {
    pub ip: IpAddr,
    pub port: u16,
}

/// Typed message bodies; the serde tag is the wire `type` string and the
/// variant fields form the `payload` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    Ping {},
    Pong {},
    FindNode {
        target_id: NodeId,
    },
    FindNodeResponse {
        nodes: Vec<NodeEntry>,
    },
    FindValue {
        key: NodeId,
    },
    /// Carries either the value or the closest contacts, never both.
    FindValueResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        nodes: Vec<NodeEntry>,
    },
    Store {
        key: NodeId,
        value: String,
    },
    StoreResponse {
        success: bool,
    },
    /// The payload carries only the transfer port; the responder records the
    /// datagram's source IP, which keeps a node from announcing third
    /// parties.
    AnnouncePeer {
        info_hash: NodeId,
        port: u16,
    },
    AnnounceResponse {
        success: bool,
    },
    GetPeers {
        info_hash: NodeId,
    },
    GetPeersResponse {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        peers: Vec<PeerEntry>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        nodes: Vec<NodeEntry>,
    },
}

impl MessageBody {
    /// Wire name of this message type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Ping {} => "PING",
            MessageBody::Pong {} => "PONG",
            MessageBody::FindNode { .. } => "FIND_NODE",
            MessageBody::FindNodeResponse { .. } => "FIND_NODE_RESPONSE",
            MessageBody::FindValue { .. } => "FIND_VALUE",
            MessageBody::FindValueResponse { .. } => "FIND_VALUE_RESPONSE",
            MessageBody::Store { .. } => "STORE",
            MessageBody::StoreResponse { .. } => "STORE_RESPONSE",
            MessageBody::AnnouncePeer { .. } => "ANNOUNCE_PEER",
            MessageBody::AnnounceResponse { .. } => "ANNOUNCE_RESPONSE",
            MessageBody::GetPeers { .. } => "GET_PEERS",
            MessageBody::GetPeersResponse { .. } => "GET_PEERS_RESPONSE",
        }
    }
}

/// A complete datagram: envelope plus body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: NodeId,
    pub message_id: MessageId,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    /// Build a request with a fresh message id.
    pub fn request(sender_id: NodeId, body: MessageBody) -> Self {
        Self {
            sender_id,
            message_id: MessageId::random(),
            body,
        }
    }

    /// Build a response echoing `request_id`.
    pub fn response(sender_id: NodeId, request_id: MessageId, body: MessageBody) -> Self {
        Self {
            sender_id,
            message_id: request_id,
            body,
        }
    }

    /// Serialize to the on-wire JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }

    /// Parse a received datagram.
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn encode_decode_is_identity() {
        let msg = Message::request(
            NodeId::random(),
            MessageBody::FindNode {
                target_id: NodeId::random(),
            },
        );
        let bytes = msg.encode().expect("encode");
        let back = Message::decode(&bytes).expect("decode");
        assert_eq!(back.sender_id, msg.sender_id);
        assert_eq!(back.message_id, msg.message_id);
        match back.body {
            MessageBody::FindNode { target_id } => match msg.body {
                MessageBody::FindNode { target_id: orig } => assert_eq!(target_id, orig),
                _ => unreachable!(),
            },
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn wire_shape_matches_protocol() {
        let msg = Message::request(NodeId::random(), MessageBody::Ping {});
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().expect("encode"))
            .expect("valid json");
        assert_eq!(value["type"], "PING");
        assert_eq!(value["sender_id"].as_str().expect("hex").len(), 40);
        assert_eq!(value["message_id"].as_str().expect("hex").len(), 16);
        assert!(value["payload"].is_object());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = format!(
            r#"{{"type":"FIND_VALUE","sender_id":"{}","message_id":"{}","payload":{{"key":"{}","extra":"x"}},"future_field":1}}"#,
            NodeId::random().to_hex(),
            MessageId::random().to_hex(),
            NodeId::random().to_hex()
        );
        Message::decode(raw.as_bytes()).expect("unknown fields tolerated");
    }

    #[test]
    fn unknown_type_is_an_error() {
        let raw = format!(
            r#"{{"type":"FROBNICATE","sender_id":"{}","message_id":"{}","payload":{{}}}}"#,
            NodeId::random().to_hex(),
            MessageId::random().to_hex()
        );
        assert!(Message::decode(raw.as_bytes()).is_err());
    }

    #[test]
    fn find_value_response_never_carries_both() {
        let with_value = MessageBody::FindValueResponse {
            value: Some("hello".into()),
            nodes: Vec::new(),
        };
        let json = serde_json::to_value(Message::request(NodeId::random(), with_value))
            .expect("serialize");
        assert!(json["payload"].get("nodes").is_none());

        let with_nodes = MessageBody::FindValueResponse {
            value: None,
            nodes: vec![NodeEntry {
                node_id: NodeId::random(),
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 8468,
            }],
        };
        let json = serde_json::to_value(Message::request(NodeId::random(), with_nodes))
            .expect("serialize");
        assert!(json["payload"].get("value").is_none());
    }

    #[test]
    fn announce_payload_has_port_but_no_ip() {
        let msg = Message::request(
            NodeId::random(),
            MessageBody::AnnouncePeer {
                info_hash: NodeId::random(),
                port: 8469,
            },
        );
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["payload"]["port"], 8469);
        assert!(json["payload"].get("ip").is_none());
    }
}
