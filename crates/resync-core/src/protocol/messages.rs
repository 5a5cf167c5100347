//! Typed synchronization messages and their JSON wire format.
//!
//! Every message is a JSON object with a `"type"` discriminator and
//! camelCase fields, e.g.
//! `{"type":"resourceChanged","project":"P","path":"a.txt","timestamp":1,"hash":"…"}`.
//! File content travels as standard base64 text.

use crate::resource::{Resource, ResourceError, ResourceType};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Message carries an invalid resource: {0}")]
    InvalidResource(#[from] ResourceError),

    #[error("Content hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

/// Discriminator of a [`Message`], used to route it to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ResourceCreated,
    ResourceChanged,
    ResourceDeleted,
    ResourceStored,
    GetResourceRequest,
    GetResourceResponse,
    ProjectConnected,
    ProjectDisconnected,
}

impl MessageType {
    /// Wire name of this message type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceCreated => "resourceCreated",
            Self::ResourceChanged => "resourceChanged",
            Self::ResourceDeleted => "resourceDeleted",
            Self::ResourceStored => "resourceStored",
            Self::GetResourceRequest => "getResourceRequest",
            Self::GetResourceResponse => "getResourceResponse",
            Self::ProjectConnected => "projectConnected",
            Self::ProjectDisconnected => "projectDisconnected",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

mod base64_content {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(content))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A resource appeared on the sending peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCreated {
    pub project: String,
    pub path: String,
    pub timestamp: i64,
    pub hash: String,
    pub resource_type: ResourceType,
}

impl ResourceCreated {
    pub fn from_resource(resource: &Resource) -> Self {
        Self {
            project: resource.project_id().to_string(),
            path: resource.path().to_string(),
            timestamp: resource.timestamp(),
            hash: resource.hash().to_string(),
            resource_type: resource.resource_type(),
        }
    }
}

/// A file's content changed on the sending peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceChanged {
    pub project: String,
    pub path: String,
    pub timestamp: i64,
    pub hash: String,
}

impl ResourceChanged {
    pub fn from_resource(resource: &Resource) -> Self {
        Self {
            project: resource.project_id().to_string(),
            path: resource.path().to_string(),
            timestamp: resource.timestamp(),
            hash: resource.hash().to_string(),
        }
    }
}

/// A resource was removed on the sending peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDeleted {
    pub project: String,
    pub path: String,
    pub timestamp: i64,
}

impl ResourceDeleted {
    pub fn from_resource(resource: &Resource) -> Self {
        Self {
            project: resource.project_id().to_string(),
            path: resource.path().to_string(),
            timestamp: resource.timestamp(),
        }
    }
}

/// Acknowledges that the sender stored a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStored {
    pub project: String,
    pub path: String,
    pub timestamp: i64,
    pub hash: String,
}

impl ResourceStored {
    pub fn from_resource(resource: &Resource) -> Self {
        Self {
            project: resource.project_id().to_string(),
            path: resource.path().to_string(),
            timestamp: resource.timestamp(),
            hash: resource.hash().to_string(),
        }
    }
}

/// Asks a peer for the current content of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResourceRequest {
    pub callback_id: String,
    pub request_sender_id: String,
    pub project: String,
    pub path: String,
    /// Version the asker expects; a responder holding a different one stays silent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Answer to a [`GetResourceRequest`], echoing its correlation ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResourceResponse {
    pub callback_id: String,
    pub request_sender_id: String,
    pub project: String,
    pub path: String,
    pub timestamp: i64,
    pub hash: String,
    #[serde(with = "base64_content", default)]
    pub content: Vec<u8>,
    pub resource_type: ResourceType,
}

impl GetResourceResponse {
    pub fn answer(request: &GetResourceRequest, resource: &Resource) -> Self {
        Self {
            callback_id: request.callback_id.clone(),
            request_sender_id: request.request_sender_id.clone(),
            project: resource.project_id().to_string(),
            path: resource.path().to_string(),
            timestamp: resource.timestamp(),
            hash: resource.hash().to_string(),
            content: resource.content().to_vec(),
            resource_type: resource.resource_type(),
        }
    }

    /// Rebuild the resource, checking the transferred content against the announced hash.
    pub fn to_resource(&self) -> Result<Resource, ProtocolError> {
        let resource = Resource::new(
            self.project.clone(),
            &self.path,
            self.timestamp,
            self.resource_type,
            self.content.clone(),
        )?;
        if resource.hash() != self.hash {
            return Err(ProtocolError::HashMismatch {
                path: self.path.clone(),
                expected: self.hash.clone(),
                actual: resource.hash().to_string(),
            });
        }
        Ok(resource)
    }
}

/// The sender started synchronizing a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConnected {
    pub project: String,
}

/// The sender stopped synchronizing a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDisconnected {
    pub project: String,
}

/// Any synchronization message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    ResourceCreated(ResourceCreated),
    ResourceChanged(ResourceChanged),
    ResourceDeleted(ResourceDeleted),
    ResourceStored(ResourceStored),
    GetResourceRequest(GetResourceRequest),
    GetResourceResponse(GetResourceResponse),
    ProjectConnected(ProjectConnected),
    ProjectDisconnected(ProjectDisconnected),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ResourceCreated(_) => MessageType::ResourceCreated,
            Self::ResourceChanged(_) => MessageType::ResourceChanged,
            Self::ResourceDeleted(_) => MessageType::ResourceDeleted,
            Self::ResourceStored(_) => MessageType::ResourceStored,
            Self::GetResourceRequest(_) => MessageType::GetResourceRequest,
            Self::GetResourceResponse(_) => MessageType::GetResourceResponse,
            Self::ProjectConnected(_) => MessageType::ProjectConnected,
            Self::ProjectDisconnected(_) => MessageType::ProjectDisconnected,
        }
    }

    /// Project the message refers to.
    pub fn project(&self) -> &str {
        match self {
            Self::ResourceCreated(m) => &m.project,
            Self::ResourceChanged(m) => &m.project,
            Self::ResourceDeleted(m) => &m.project,
            Self::ResourceStored(m) => &m.project,
            Self::GetResourceRequest(m) => &m.project,
            Self::GetResourceResponse(m) => &m.project,
            Self::ProjectConnected(m) => &m.project,
            Self::ProjectDisconnected(m) => &m.project,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Message serialization should not fail")
    }

    /// Parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn as_value(message: &Message) -> Value {
        serde_json::from_slice(&message.to_json()).unwrap()
    }

    #[test]
    fn test_resource_created_wire_shape() {
        let resource = Resource::folder("P", "b/", 42).unwrap();
        let message = Message::ResourceCreated(ResourceCreated::from_resource(&resource));
        let json = as_value(&message);

        assert_eq!(json["type"], "resourceCreated");
        assert_eq!(json["project"], "P");
        assert_eq!(json["path"], "b");
        assert_eq!(json["timestamp"], 42);
        assert_eq!(json["hash"], "0");
        assert_eq!(json["resourceType"], "FOLDER");
    }

    #[test]
    fn test_request_timestamp_is_optional() {
        let json = br#"{"type":"getResourceRequest","callbackId":"c1","requestSenderId":"r1","project":"P","path":"a.txt"}"#;
        let message = Message::from_json(json).unwrap();
        match message {
            Message::GetResourceRequest(request) => {
                assert_eq!(request.callback_id, "c1");
                assert_eq!(request.request_sender_id, "r1");
                assert_eq!(request.timestamp, None);
            }
            other => panic!("Expected GetResourceRequest, got {:?}", other),
        }

        let without = Message::GetResourceRequest(GetResourceRequest {
            callback_id: "c".into(),
            request_sender_id: "r".into(),
            project: "P".into(),
            path: "a.txt".into(),
            timestamp: None,
        });
        assert!(as_value(&without).get("timestamp").is_none());
    }

    #[test]
    fn test_response_content_is_base64() {
        let resource = Resource::file("P", "a.txt", 7, b"hello".to_vec()).unwrap();
        let request = GetResourceRequest {
            callback_id: "cb".into(),
            request_sender_id: "me".into(),
            project: "P".into(),
            path: "a.txt".into(),
            timestamp: Some(7),
        };
        let message = Message::GetResourceResponse(GetResourceResponse::answer(&request, &resource));
        let json = as_value(&message);

        assert_eq!(json["content"], "aGVsbG8=");
        assert_eq!(json["callbackId"], "cb");
        assert_eq!(json["resourceType"], "FILE");

        let parsed = Message::from_json(&message.to_json()).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_response_to_resource_checks_hash() {
        let resource = Resource::file("P", "a.txt", 7, b"hello".to_vec()).unwrap();
        let request = GetResourceRequest {
            callback_id: "cb".into(),
            request_sender_id: "me".into(),
            project: "P".into(),
            path: "a.txt".into(),
            timestamp: None,
        };
        let mut response = GetResourceResponse::answer(&request, &resource);
        assert_eq!(response.to_resource().unwrap(), resource);

        response.content = b"tampered".to_vec();
        assert!(matches!(
            response.to_resource(),
            Err(ProtocolError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_project_messages() {
        let message = Message::ProjectConnected(ProjectConnected {
            project: "P".into(),
        });
        assert_eq!(message.message_type(), MessageType::ProjectConnected);
        assert_eq!(message.project(), "P");
        assert_eq!(
            String::from_utf8(message.to_json()).unwrap(),
            r#"{"type":"projectConnected","project":"P"}"#
        );
    }

    #[test]
    fn test_malformed_messages_fail_to_decode() {
        assert!(Message::from_json(b"not json").is_err());
        assert!(Message::from_json(br#"{"type":"unknownThing"}"#).is_err());
        // Missing required hash
        assert!(Message::from_json(
            br#"{"type":"resourceChanged","project":"P","path":"a","timestamp":1}"#
        )
        .is_err());
        // Invalid base64 content
        assert!(Message::from_json(
            br#"{"type":"getResourceResponse","callbackId":"c","requestSenderId":"r","project":"P","path":"a","timestamp":1,"hash":"0","content":"!!!","resourceType":"FILE"}"#
        )
        .is_err());
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(MessageType::GetResourceResponse.as_str(), "getResourceResponse");
        assert_eq!(MessageType::ResourceStored.to_string(), "resourceStored");
    }
}
