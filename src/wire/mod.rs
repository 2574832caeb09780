//! The wire format shared by the hub, the worker SDK and the gateway.
//!
//! A single record type, [`Message`], travels in both directions on every
//! stream. Frames are length-delimited CBOR (see [`codec`]); the
//! [`MessageType`] discriminator is serialized as a stable small integer so
//! SDKs in other languages can match on it without knowing Rust enum names.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

pub mod codec;
pub mod files;
mod payload;

pub use payload::{
    Capability, DiscoveryResponse, RegistrationPayload, WorkerDescriptor,
    WorkerStatus,
};

/// Metadata keys the hub itself interprets. Everything else in
/// `Message.metadata` is passed through untouched.
pub mod meta {
    /// Authoritative capability name for REQUEST / WORKER_CALL frames.
    pub const CAPABILITY: &str = "capability";
    /// The original REQUEST `id` a RESPONSE answers.
    pub const REQUEST_ID: &str = "request_id";
    /// Outcome of a handled request: [`SUCCESS`] or [`ERROR`].
    pub const STATUS: &str = "status";

    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
}

/// Channel name that marks a REQUEST as a capability-discovery query,
/// answered by the hub itself instead of being routed to a worker.
pub const DISCOVERY_CHANNEL: &str = "capability_discovery";

/// `to` value (besides empty) that asks the hub to resolve the target
/// worker from the capability index.
pub const HUB_ADDRESS_NAME: &str = "hub";

#[derive(Error, Debug)]
#[error("unknown message type discriminator: {0}")]
pub struct UnknownMessageType(pub u8);

/// Message type discriminator, wire-encoded as its numeric value.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::FromRepr,
)]
#[serde(into = "u8", try_from = "u8")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum MessageType {
    Direct = 0,
    Broadcast = 1,
    Channel = 2,
    Register = 3,
    Request = 4,
    Response = 5,
    WorkerCall = 6,
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(raw: u8) -> Result<Self, UnknownMessageType> {
        Self::from_repr(raw).ok_or(UnknownMessageType(raw))
    }
}

/// The sole record exchanged on hub streams.
///
/// `content` is an opaque UTF-8 payload (serialized JSON by convention); the
/// hub never validates it, it only decodes it where a routing rule requires
/// a peek (capability fallback, discovery detection, registration).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Message {
    /// A blank message of the given type with a fresh id and timestamp.
    pub fn new(kind: MessageType) -> Self {
        Self {
            id: Ulid::new().to_string(),
            from: String::new(),
            to: String::new(),
            channel: String::new(),
            content: String::new(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            kind,
            action: String::new(),
            metadata: HashMap::new(),
        }
    }

    /// A capability invocation. Leave `to` empty to let the hub resolve the
    /// worker from its capability index.
    pub fn request(
        from: impl Into<String>,
        to: impl Into<String>,
        capability: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let capability = capability.into();
        let mut msg = Self::new(MessageType::Request);
        msg.from = from.into();
        msg.to = to.into();
        msg.channel = capability.clone();
        msg.content = content.into();
        msg.metadata.insert(meta::CAPABILITY.into(), capability);
        msg
    }

    /// A direct worker-to-worker invocation. `to` must name a connected
    /// worker; the hub forwards the frame unchanged.
    pub fn worker_call(
        from: impl Into<String>,
        to: impl Into<String>,
        capability: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::request(from, to, capability, content);
        msg.kind = MessageType::WorkerCall;
        msg
    }

    /// A successful RESPONSE answering `request`, per the SDK contract:
    /// same `id`, addressed back to the requester, correlated through
    /// `metadata[request_id]`.
    pub fn response_to(
        request: &Message,
        from: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(MessageType::Response);
        msg.id = request.id.clone();
        msg.from = from.into();
        msg.to = request.from.clone();
        msg.content = content.into();
        msg.metadata
            .insert(meta::REQUEST_ID.into(), request.id.clone());
        msg.metadata.insert(meta::STATUS.into(), meta::SUCCESS.into());
        msg
    }

    /// An error RESPONSE answering `request`.
    pub fn error_response_to(
        request: &Message,
        from: impl Into<String>,
        error: impl AsRef<str>,
    ) -> Self {
        let mut msg = Self::response_to(
            request,
            from,
            serde_json::json!({
                "error": error.as_ref(),
                "status": "failed",
            })
            .to_string(),
        );
        msg.metadata.insert(meta::STATUS.into(), meta::ERROR.into());
        msg
    }

    /// A REGISTER frame carrying the worker's capability listing.
    pub fn register(registration: &RegistrationPayload) -> Self {
        let mut msg = Self::new(MessageType::Register);
        msg.from = registration.worker_id.clone();
        msg.action = "register".into();
        msg.content = serde_json::to_string(registration)
            .expect("registration payload serializes");
        msg
    }

    /// The capability name this frame targets.
    ///
    /// Senders are allowed to carry the name in three places; the
    /// precedence is `metadata[capability]`, then `channel`, then a
    /// `capability` key inside JSON `content`.
    pub fn capability(&self) -> Option<String> {
        if let Some(name) = self.metadata.get(meta::CAPABILITY)
            && !name.is_empty()
        {
            return Some(name.clone());
        }
        if !self.channel.is_empty() {
            return Some(self.channel.clone());
        }
        serde_json::from_str::<serde_json::Value>(&self.content)
            .ok()?
            .get("capability")?
            .as_str()
            .map(str::to_owned)
    }

    /// The request id a RESPONSE correlates to: `metadata[request_id]` when
    /// present, falling back to the frame's own `id`.
    pub fn request_ref(&self) -> &str {
        self.metadata
            .get(meta::REQUEST_ID)
            .map_or(self.id.as_str(), String::as_str)
    }

    /// Whether this RESPONSE reports a handler failure.
    pub fn is_error(&self) -> bool {
        self.metadata.get(meta::STATUS).map(String::as_str)
            == Some(meta::ERROR)
    }

    pub fn set_status(&mut self, status: &str) {
        self.metadata.insert(meta::STATUS.into(), status.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_discriminators_are_stable() {
        assert_eq!(u8::from(MessageType::Direct), 0);
        assert_eq!(u8::from(MessageType::WorkerCall), 6);
        assert_eq!(MessageType::try_from(4).unwrap(), MessageType::Request);
        assert!(MessageType::try_from(7).is_err());
    }

    #[test]
    fn capability_precedence() {
        let mut msg = Message::new(MessageType::Request);
        msg.content = r#"{"capability":"from_content"}"#.into();
        assert_eq!(msg.capability().as_deref(), Some("from_content"));

        msg.channel = "from_channel".into();
        assert_eq!(msg.capability().as_deref(), Some("from_channel"));

        msg.metadata
            .insert(meta::CAPABILITY.into(), "from_metadata".into());
        assert_eq!(msg.capability().as_deref(), Some("from_metadata"));
    }

    #[test]
    fn capability_absent_when_unnamed() {
        let mut msg = Message::new(MessageType::Request);
        msg.content = r#"{"params":{}}"#.into();
        assert_eq!(msg.capability(), None);
    }

    #[test]
    fn response_correlates_to_request() {
        let req = Message::request("client", "", "echo", "{}");
        let resp = Message::response_to(&req, "worker", r#"{"ok":true}"#);

        assert_eq!(resp.id, req.id);
        assert_eq!(resp.to, "client");
        assert_eq!(resp.request_ref(), req.id);
        assert!(!resp.is_error());
    }

    #[test]
    fn error_response_carries_failed_payload() {
        let req = Message::request("client", "", "echo", "{}");
        let resp = Message::error_response_to(&req, "hub", "boom");

        assert!(resp.is_error());
        let content: serde_json::Value =
            serde_json::from_str(&resp.content).unwrap();
        assert_eq!(content["error"], "boom");
        assert_eq!(content["status"], "failed");
    }

    #[test]
    fn request_ref_falls_back_to_id() {
        let mut msg = Message::new(MessageType::Response);
        assert_eq!(msg.request_ref(), msg.id);
        msg.metadata.insert(meta::REQUEST_ID.into(), "orig".into());
        assert_eq!(msg.request_ref(), "orig");
    }
}
