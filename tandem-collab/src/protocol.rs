//! JSON wire protocol between clients and the relay.
//!
//! Every frame is one [`Message`]. The `type` string is the dispatch
//! discriminator; the remaining fields are type-specific:
//!
//! | type        | id                  | text                  |
//! |-------------|---------------------|-----------------------|
//! | `siteID`    | recipient           | assigned site id      |
//! | `docReq`    | requesting newcomer | —                     |
//! | `docSync`   | recipient           | document snapshot     |
//! | `join`      | sender (stamped)    | —                     |
//! | `users`     | any room member     | comma-joined names    |
//! | `operation` | sender (stamped)    | —                     |
//!
//! The relay never inspects `operation` payloads; they are opaque CRDT
//! operations replayed verbatim to the other room members.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use tandem_crdt::Operation;

/// Message discriminator, serialized as the wire's `type` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "docSync")]
    DocSync,
    #[serde(rename = "docReq")]
    DocReq,
    #[serde(rename = "siteID")]
    SiteId,
    #[serde(rename = "join")]
    Join,
    #[serde(rename = "users")]
    Users,
    #[serde(rename = "operation")]
    Operation,
}

/// One framed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Sender's id for inbound operations; recipient's id for addressed
    /// server-to-client frames (`siteID`, `docSync`).
    #[serde(default = "Uuid::nil", skip_serializing_if = "Uuid::is_nil")]
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
}

impl Message {
    fn bare(kind: MessageKind) -> Self {
        Self {
            kind,
            id: Uuid::nil(),
            text: String::new(),
            username: String::new(),
            operation: None,
        }
    }

    /// Tell a freshly connected client its assigned site id.
    pub fn site_id(recipient: Uuid, site_id: &str) -> Self {
        Self {
            id: recipient,
            text: site_id.to_owned(),
            ..Self::bare(MessageKind::SiteId)
        }
    }

    /// Ask an existing room member to send its document to `newcomer`.
    pub fn doc_req(newcomer: Uuid) -> Self {
        Self {
            id: newcomer,
            ..Self::bare(MessageKind::DocReq)
        }
    }

    /// A document snapshot addressed to `recipient`.
    pub fn doc_sync(recipient: Uuid, snapshot: String) -> Self {
        Self {
            id: recipient,
            text: snapshot,
            ..Self::bare(MessageKind::DocSync)
        }
    }

    /// Announce a username. The relay stamps the sender id on arrival.
    pub fn join(username: &str) -> Self {
        Self {
            username: username.to_owned(),
            ..Self::bare(MessageKind::Join)
        }
    }

    /// The current usernames of a room, comma-joined. `member` is any
    /// client currently in the room, used to resolve it.
    pub fn users(member: Uuid, names: String) -> Self {
        Self {
            id: member,
            text: names,
            ..Self::bare(MessageKind::Users)
        }
    }

    /// A CRDT operation to replicate to the other room members.
    pub fn operation(op: Operation) -> Self {
        Self {
            operation: Some(op),
            ..Self::bare(MessageKind::Operation)
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Deserialize a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(ProtocolError::Decode)
    }
}

/// Protocol and transport errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("room name missing from connection request")]
    MissingRoom,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("not connected")]
    NotConnected,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}
