//! Channel-join frame exchanged when a connection opens.
//!
//! Each side sends exactly one join frame before any synchronization
//! message. The channel is the identity from the connecting side's
//! credentials; the token is passed through untouched.

use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// Increment when making breaking changes to the protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum accepted frame size (50MB) to prevent memory exhaustion from malicious peers.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Opaque credentials used to join a channel on a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Channel identity the connection joins.
    pub identity: String,
    /// Opaque token, never inspected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Credentials {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Join frame.
///
/// Wire format: `{"type":"join","version":1,"channel":"…","token":"…"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMessage {
    /// Message type discriminator
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Protocol version
    pub version: u32,
    /// Channel being joined
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl JoinMessage {
    pub fn new(credentials: &Credentials) -> Self {
        Self {
            msg_type: "join".to_string(),
            version: PROTOCOL_VERSION,
            channel: credentials.identity.clone(),
            token: credentials.token.clone(),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("JoinMessage serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for non-JSON input or if the `type` field isn't `"join"`.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let msg: Self = serde_json::from_slice(data).ok()?;
        if msg.msg_type == "join" {
            Some(msg)
        } else {
            None
        }
    }

    /// Check if we should log a version mismatch warning.
    pub fn should_warn_version(&self) -> bool {
        self.version != PROTOCOL_VERSION
    }
}
