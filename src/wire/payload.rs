//! JSON payload contracts carried inside `Message.content`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_http_method() -> String {
    "POST".into()
}

/// A named unit of work a worker offers.
///
/// The schemas are documentation only; the hub never validates payloads
/// against them. The `http_*` fields are projection hints for the gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Value,
    #[serde(default = "default_http_method")]
    pub http_method: String,
    #[serde(default)]
    pub accepts_file: bool,
    #[serde(default)]
    pub file_field_name: Option<String>,
}

impl Capability {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: Value::Null,
            output_schema: Value::Null,
            http_method: default_http_method(),
            accepts_file: false,
            file_field_name: None,
        }
    }

    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn http_method(mut self, method: impl Into<String>) -> Self {
        self.http_method = method.into();
        self
    }

    pub fn accepts_file(mut self, field_name: impl Into<String>) -> Self {
        self.accepts_file = true;
        self.file_field_name = Some(field_name.into());
        self
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Offline,
}

/// A connected (or recently connected) worker and everything it declared.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub worker_type: String,
    pub status: WorkerStatus,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Decoded `content` of a REGISTER frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationPayload {
    pub worker_id: String,
    #[serde(default)]
    pub worker_type: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RegistrationPayload {
    /// The descriptor this registration produces, stamped with the current
    /// time.
    pub fn into_descriptor(self) -> WorkerDescriptor {
        let now = Utc::now();
        WorkerDescriptor {
            id: self.worker_id,
            worker_type: self.worker_type,
            status: WorkerStatus::Online,
            capabilities: self.capabilities,
            metadata: self.metadata,
            registered_at: now,
            last_seen: now,
        }
    }
}

/// Decoded `content` of the hub's answer to a discovery query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub capabilities: HashMap<String, Capability>,
    pub workers: Vec<WorkerDescriptor>,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_defaults_fill_in() {
        let cap: Capability =
            serde_json::from_str(r#"{"name":"echo"}"#).unwrap();
        assert_eq!(cap.http_method, "POST");
        assert!(!cap.accepts_file);
        assert_eq!(cap.input_schema, Value::Null);
    }

    #[test]
    fn registration_round_trips() {
        let payload = RegistrationPayload {
            worker_id: "w1".into(),
            worker_type: "rust".into(),
            capabilities: vec![
                Capability::new("echo", "echo back").accepts_file("file"),
            ],
            metadata: HashMap::new(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: RegistrationPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.worker_id, "w1");
        assert_eq!(back.capabilities, payload.capabilities);

        let desc = back.into_descriptor();
        assert_eq!(desc.status, WorkerStatus::Online);
        assert_eq!(desc.capabilities.len(), 1);
    }

    #[test]
    fn worker_status_tags() {
        assert_eq!(
            serde_json::to_string(&WorkerStatus::Online).unwrap(),
            r#""online""#
        );
        assert_eq!(WorkerStatus::Offline.to_string(), "offline");
    }
}
