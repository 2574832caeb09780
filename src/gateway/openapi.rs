//! OpenAPI 3 projection of the live capability table.
//!
//! The document is rebuilt from a fresh discovery snapshot on every
//! request, so it always reflects the workers currently registered. Error
//! responses come from [`ApiError`]'s `EndpointOutRegister` registration,
//! the same source the rendered errors use, so the document cannot drift
//! from the gateway's actual failure surface.

use salvo::oapi::{self, EndpointOutRegister};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::wire::{Capability, DiscoveryResponse};

pub fn project(discovery: &DiscoveryResponse) -> Value {
    // One registration pass yields both the error response table shared by
    // every operation and the schemas it references.
    let mut components = oapi::Components::new();
    let mut error_probe = oapi::Operation::new();
    ApiError::register(&mut components, &mut error_probe);
    let error_responses = serde_json::to_value(&error_probe.responses)
        .unwrap_or_else(|_| json!({}));

    let mut paths = serde_json::Map::new();
    let mut names: Vec<&String> = discovery.capabilities.keys().collect();
    names.sort();
    for name in names {
        let cap = &discovery.capabilities[name];
        paths.insert(
            format!("/api/call/{name}"),
            json!({
                cap.http_method.to_lowercase():
                    operation(cap, &error_responses)
            }),
        );
    }

    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "caphub gateway",
            "description":
                "Capabilities exposed by currently registered workers",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": Value::Object(paths),
        "components": serde_json::to_value(&components)
            .unwrap_or_else(|_| json!({})),
    })
}

fn operation(cap: &Capability, error_responses: &Value) -> Value {
    let request_body = if cap.accepts_file {
        let file_field =
            cap.file_field_name.clone().unwrap_or_else(|| "file".into());
        json!({
            "required": true,
            "content": {
                "multipart/form-data": {
                    "schema": {
                        "type": "object",
                        "properties": {
                            file_field: {
                                "type": "string",
                                "format": "binary",
                            },
                        },
                    },
                },
            },
        })
    } else {
        let schema = if cap.input_schema.is_null() {
            json!({ "type": "object" })
        } else {
            cap.input_schema.clone()
        };
        json!({
            "required": true,
            "content": { "application/json": { "schema": schema } },
        })
    };

    let mut responses = error_responses
        .as_object()
        .cloned()
        .unwrap_or_default();
    responses.insert(
        "200".into(),
        json!({
            "description": "Invocation result envelope",
            "content": { "application/json": { "schema": {
                "type": "object",
                "properties": {
                    "status": { "type": "string" },
                    "response": { "type": "string" },
                    "from": { "type": "string" },
                    "timestamp": { "type": "string" },
                },
            } } },
        }),
    );

    json!({
        "summary": cap.description,
        "operationId": cap.name,
        "requestBody": request_body,
        "responses": Value::Object(responses),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn discovery(caps: Vec<Capability>) -> DiscoveryResponse {
        DiscoveryResponse {
            capabilities: caps
                .into_iter()
                .map(|cap| (cap.name.clone(), cap))
                .collect(),
            workers: Vec::new(),
            timestamp: String::new(),
        }
    }

    #[test]
    fn projects_one_path_per_capability() {
        let doc = project(&discovery(vec![
            Capability::new("echo", "Echo"),
            Capability::new("stats", "Stats").http_method("GET"),
        ]));

        let paths = doc["paths"].as_object().unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths["/api/call/echo"]["post"].is_object());
        assert!(paths["/api/call/stats"]["get"].is_object());
    }

    #[test]
    fn file_capabilities_get_multipart_bodies() {
        let doc = project(&discovery(vec![
            Capability::new("ingest", "Ingest a file").accepts_file("upload"),
        ]));

        let body =
            &doc["paths"]["/api/call/ingest"]["post"]["requestBody"];
        let multipart = &body["content"]["multipart/form-data"];
        assert!(
            multipart["schema"]["properties"]["upload"]["format"] == "binary"
        );
    }

    #[test]
    fn declared_input_schema_is_carried_through() {
        let schema = json!({
            "type": "object",
            "properties": { "msg": { "type": "string" } },
        });
        let doc = project(&discovery(vec![
            Capability::new("echo", "Echo").input_schema(schema.clone()),
        ]));

        assert_eq!(
            doc["paths"]["/api/call/echo"]["post"]["requestBody"]["content"]
                ["application/json"]["schema"],
            schema
        );
    }

    #[test]
    fn error_responses_come_from_api_error_registration() {
        let doc =
            project(&discovery(vec![Capability::new("echo", "Echo")]));

        let responses = &doc["paths"]["/api/call/echo"]["post"]["responses"];
        assert!(responses["200"].is_object());
        for status in ["400", "408", "500"] {
            assert!(
                responses[status].is_object(),
                "missing {status} response"
            );
        }
        // The registered error schema lands in the document's components.
        assert!(doc["components"].is_object());
    }
}
