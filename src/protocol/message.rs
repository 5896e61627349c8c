//! Wire messages for the update channel.
//!
//! Everything crossing the socket is JSON with an internal `type` tag,
//! like `{"type":"request",...}`, so clients in any language can dispatch
//! on one field.

use serde::{Deserialize, Serialize};

use super::update::Update;
use crate::ids::{BuildHash, ClientId};

/// Client question: what changed since my current hash?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Which build configuration the client was built from.
    pub configuration: String,
    /// The client's live build hash; empty means "no baseline yet".
    pub current_hash: BuildHash,
    /// Server-minted id from an earlier response, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
}

impl UpdateRequest {
    pub fn new(configuration: impl Into<String>, current_hash: BuildHash) -> Self {
        Self {
            configuration: configuration.into(),
            current_hash,
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }
}

/// Server answer to an [`UpdateRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateResponse {
    /// The requested configuration is not served here. A client setup
    /// bug; nothing recovers automatically.
    Unregistered,
    /// The client's hash is not in retained history (typically because
    /// the server restarted); no delta path exists.
    Incompatible { client_id: ClientId },
    /// Ordered updates from the client's own position through the latest,
    /// starting with the entry matching the client's hash.
    Compatible {
        client_id: ClientId,
        updates_to_apply: Vec<Update>,
    },
}

/// Envelope for everything that crosses the update channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Connection established (server to client).
    Connected { version: String },
    /// Update request (client to server).
    Request { request: UpdateRequest },
    /// Answer to the pending request on this connection.
    Response { response: UpdateResponse },
    /// A new build landed for `configuration`; clients sync in response.
    UpdateAvailable { configuration: String },
    /// Keep-alive probe.
    Ping { ts: u64 },
    /// Keep-alive reply, echoing the probe timestamp.
    Pong { ts: u64 },
}

impl WireMessage {
    /// Create a connected message with the current crate version.
    pub fn connected() -> Self {
        Self::Connected {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn request(request: UpdateRequest) -> Self {
        Self::Request { request }
    }

    pub fn response(response: UpdateResponse) -> Self {
        Self::Response { response }
    }

    pub fn update_available(configuration: impl Into<String>) -> Self {
        Self::UpdateAvailable {
            configuration: configuration.into(),
        }
    }

    /// Create a ping message with the current timestamp.
    pub fn ping() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::Ping { ts }
    }

    pub fn pong(ts: u64) -> Self {
        Self::Pong { ts }
    }

    /// Serialize to a JSON string for the socket.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"ping","ts":0}"#.to_string())
    }

    /// Parse a message from JSON, returning `None` on malformed input.
    pub fn from_json(json: &str) -> Option<Self> {
        serde_json::from_str(json).ok()
    }
}
