//! HTTP→hub gateway.
//!
//! A salvo application fronting the hub: capability discovery, an OpenAPI
//! projection with a Swagger UI, and the invocation endpoints that turn an
//! HTTP request into a hub REQUEST and wait for the correlated RESPONSE.

use std::time::Duration;

use base64::Engine;
use chrono::{SecondsFormat, Utc};
use salvo::cors::{self, Cors};
use salvo::http::Method;
use salvo::oapi::swagger_ui::SwaggerUi;
use salvo::prelude::*;
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::wire::Message;

pub mod client;
mod logger;
pub mod openapi;

pub use client::HubClient;

pub type JsonResult<T> = Result<Json<T>, ApiError>;

const SWAGGER_JSON: &str = "/api/swagger.json";

#[derive(Clone)]
pub struct GatewayState {
    pub client: HubClient,
    pub request_timeout: Duration,
}

pub fn root(state: GatewayState) -> Router {
    let cors = Cors::new()
        .allow_origin(cors::Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(cors::Any)
        .into_handler();

    let api = Router::with_path("api")
        .hoop(logger::RequestLog)
        .hoop(cors)
        .hoop(salvo::affix_state::inject(state))
        .hoop(Timeout::new(Duration::from_secs(60)))
        .push(Router::with_path("capabilities").get(list_capabilities))
        .push(Router::with_path("swagger.json").get(swagger_json))
        .push(Router::with_path("status").get(status))
        .push(Router::with_path("call/{capability}").post(call_resolved))
        .push(
            Router::with_path("{worker_id}/call/{capability}")
                .post(call_worker),
        );

    Router::new()
        .push(api)
        .unshift(SwaggerUi::new(SWAGGER_JSON).into_router("api/docs"))
}

fn state_of(depot: &Depot) -> &GatewayState {
    depot
        .obtain::<GatewayState>()
        .expect("gateway state should be injected")
}

/// Live snapshot of the hub's capability and worker tables.
#[handler]
async fn list_capabilities(depot: &mut Depot) -> JsonResult<Value> {
    let state = state_of(depot);
    let discovery = state.client.discover(state.request_timeout).await?;
    Ok(Json(serde_json::to_value(&discovery).map_err(
        crate::error::HubError::from,
    )?))
}

/// OpenAPI 3 projection of the capability table.
#[handler]
async fn swagger_json(depot: &mut Depot) -> JsonResult<Value> {
    let state = state_of(depot);
    let discovery = state.client.discover(state.request_timeout).await?;
    Ok(Json(openapi::project(&discovery)))
}

#[handler]
async fn status(depot: &mut Depot) -> JsonResult<Value> {
    let state = state_of(depot);
    let discovery = state.client.discover(state.request_timeout).await?;

    let mut endpoints: Vec<String> = discovery
        .capabilities
        .keys()
        .map(|name| format!("POST /api/call/{name}"))
        .collect();
    for worker in &discovery.workers {
        for cap in &worker.capabilities {
            endpoints
                .push(format!("POST /api/{}/call/{}", worker.id, cap.name));
        }
    }
    endpoints.sort();

    Ok(Json(json!({
        "status": "running",
        "endpoints": endpoints,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })))
}

/// Legacy invocation: no worker id, the hub resolves the capability.
#[handler]
async fn call_resolved(
    req: &mut Request,
    depot: &mut Depot,
) -> JsonResult<Value> {
    let capability = req
        .param::<String>("capability")
        .ok_or_else(|| ApiError::BadRequest("missing capability".into()))?;
    invoke(req, depot, String::new(), capability).await
}

/// Invocation pinned to a specific worker.
#[handler]
async fn call_worker(
    req: &mut Request,
    depot: &mut Depot,
) -> JsonResult<Value> {
    let worker_id = req
        .param::<String>("worker_id")
        .ok_or_else(|| ApiError::BadRequest("missing worker id".into()))?;
    let capability = req
        .param::<String>("capability")
        .ok_or_else(|| ApiError::BadRequest("missing capability".into()))?;
    invoke(req, depot, worker_id, capability).await
}

async fn invoke(
    req: &mut Request,
    depot: &Depot,
    worker_id: String,
    capability: String,
) -> JsonResult<Value> {
    let envelope = request_envelope(req).await?;
    let state = state_of(depot);

    let msg = Message::request(
        state.client.client_id(),
        worker_id,
        capability.as_str(),
        envelope.to_string(),
    );
    tracing::debug!(%capability, request_id = %msg.id, "Invoking");

    let response = state.client.request(msg, state.request_timeout).await?;
    if response.is_error() {
        return Err(ApiError::Upstream(response.content));
    }
    Ok(Json(json!({
        "status": "success",
        "response": response.content,
        "from": response.from,
        "timestamp": response.timestamp,
    })))
}

/// Fold the HTTP body into the JSON envelope a worker receives.
///
/// JSON bodies pass through unchanged (an empty body becomes `{}`). For
/// multipart bodies every text field is carried over, the first file is
/// base64-encoded under its form field name, and `filename`, `size` and
/// `content_type` are injected beside it.
async fn request_envelope(req: &mut Request) -> Result<Value, ApiError> {
    let is_multipart = req
        .content_type()
        .is_some_and(|mime| mime.subtype() == salvo::http::mime::FORM_DATA);

    if !is_multipart {
        let body = req.payload().await.map_err(|err| {
            ApiError::BadRequest(format!("unreadable body: {err}"))
        })?;
        if body.is_empty() {
            return Ok(json!({}));
        }
        return serde_json::from_slice::<Value>(body).map_err(|err| {
            ApiError::BadRequest(format!("body is not valid JSON: {err}"))
        });
    }

    let form = req.form_data().await.map_err(|err| {
        ApiError::BadRequest(format!("unreadable multipart body: {err}"))
    })?;

    let mut envelope = serde_json::Map::new();
    for (key, value) in form.fields.flat_iter() {
        // A field that parses as JSON keeps its structure.
        let value = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.clone()));
        envelope.insert(key.clone(), value);
    }

    if let Some((field, file)) = form.files.iter().next() {
        let bytes = tokio::fs::read(file.path()).await.map_err(|err| {
            ApiError::BadRequest(format!("unreadable upload: {err}"))
        })?;
        envelope.insert(
            "size".into(),
            Value::Number(serde_json::Number::from(bytes.len())),
        );
        envelope.insert(
            field.clone(),
            Value::String(
                base64::engine::general_purpose::STANDARD.encode(&bytes),
            ),
        );
        if let Some(name) = file.name() {
            envelope.insert("filename".into(), Value::String(name.into()));
        }
        if let Some(mime) = file.content_type() {
            envelope.insert(
                "content_type".into(),
                Value::String(mime.to_string()),
            );
        }
    }

    Ok(Value::Object(envelope))
}
