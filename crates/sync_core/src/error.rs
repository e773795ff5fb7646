use std::time::Duration;

use shared::error::{ApiException, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid hub endpoint {0}")]
    Endpoint(String),
    #[error("failed to open hub connection: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("hub connection is not connected")]
    NotConnected,
    #[error("hub connection was stopped while connecting")]
    Stopped,
    #[error("connection lost before `{method}` completed")]
    ConnectionLost { method: String },
    #[error("`{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("`{method}` failed on the hub: {message}")]
    Remote { method: String, message: String },
    #[error(transparent)]
    NotReady(#[from] ReadyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadyError {
    #[error("hub did not become ready within {0:?}")]
    TimedOut(Duration),
    #[error("readiness wait was cancelled")]
    Cancelled,
    #[error("hub channel was dropped")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ApiFailure {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Api(#[from] ApiException),
    #[error("invalid request url: {0}")]
    Url(#[from] url::ParseError),
}
