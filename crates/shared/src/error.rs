use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 409 | 422 => Self::Validation,
            429 => Self::RateLimited,
            _ => Self::Internal,
        }
    }
}

/// Error body returned by the chat backend: `{ "message": ..., "statusCode": ... }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Error)]
#[error("{code:?} ({status}): {message}")]
pub struct ApiException {
    pub code: ErrorCode,
    pub status: u16,
    pub message: String,
}

impl ApiException {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::from_status(status),
            status,
            message: message.into(),
        }
    }

    pub fn from_body(status: u16, body: ApiErrorBody) -> Self {
        let status = body.status_code.unwrap_or(status);
        Self::new(
            status,
            body.message
                .unwrap_or_else(|| "An error occurred".to_string()),
        )
    }
}

/// Failures decoding hub frames or event payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed hub frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hub frame of type {kind} is missing `{field}`")]
    MissingField { kind: u8, field: &'static str },
    #[error("event `{target}` carried no arguments")]
    MissingArguments { target: &'static str },
    #[error("event `{target}` has an unexpected payload: {source}")]
    BadPayload {
        target: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("hub handshake rejected: {0}")]
    HandshakeRejected(String),
}
