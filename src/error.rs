use salvo::http::{StatusCode, StatusError};
use salvo::oapi::{self, EndpointOutRegister, ToSchema};
use salvo::prelude::*;
use thiserror::Error;

/// Errors produced by the hub core, the worker SDK and the gateway's hub
/// client. The gateway wraps these in [`ApiError`] before rendering them to
/// HTTP callers.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Frame(String),
    #[error("No worker available for capability: {0}")]
    UnknownCapability(String),
    #[error("Target worker not connected: {0}")]
    UnknownTarget(String),
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("malformed message content: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database connection error: {0}")]
    DatabaseConnection(#[from] diesel::ConnectionError),
    #[error("database pool error: {0}")]
    DatabasePool(#[from] diesel::r2d2::PoolError),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("peer disconnected")]
    Disconnected,
}

pub type HubResult<T> = Result<T, HubError>;

/// Errors rendered by the HTTP gateway.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error("{0}")]
    BadRequest(String),
    /// An error RESPONSE frame relayed from the hub or a worker. The payload
    /// is the raw `content` of that frame and is propagated verbatim.
    #[error("upstream error")]
    Upstream(String),
}

impl Scribe for ApiError {
    fn render(self, res: &mut Response) {
        match self {
            // Hub wait expired -> 408, the caller may retry
            Self::Hub(HubError::Timeout) => {
                res.render(
                    StatusError::request_timeout()
                        .brief("Request to hub timed out"),
                );
            }
            Self::Hub(err) => {
                tracing::error!(error = %err, "Hub request failed");
                res.render(
                    StatusError::internal_server_error().brief(err.to_string()),
                );
            }
            Self::BadRequest(brief) => {
                res.render(StatusError::bad_request().brief(brief));
            }
            // Propagate the upstream error payload as-is with a 500
            Self::Upstream(content) => {
                res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
                match serde_json::from_str::<serde_json::Value>(&content) {
                    Ok(value) => res.render(Json(value)),
                    Err(_) => {
                        res.render(Json(serde_json::json!({ "error": content })))
                    }
                }
            }
        }
    }
}

impl EndpointOutRegister for ApiError {
    fn register(
        components: &mut oapi::Components,
        operation: &mut oapi::Operation,
    ) {
        let responses = [
            (StatusCode::BAD_REQUEST, "Malformed request body"),
            (StatusCode::REQUEST_TIMEOUT, "Hub did not answer in time"),
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Hub or worker reported an error",
            ),
        ];

        for (status, description) in responses {
            operation.responses.insert(
                status.as_str(),
                oapi::Response::new(description).add_content(
                    "application/json",
                    StatusError::to_schema(components),
                ),
            );
        }
    }
}
