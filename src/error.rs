// src/error.rs
//! Error taxonomy for the fetch pipeline and the HTTP mirror.
//!
//! Fetch failures are contained at the smallest scope (one feed, one endpoint,
//! one data class). `FetchError` keeps the kinds apart so callers can tell a
//! cancelled request or an open circuit from a fresh upstream failure.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request cancelled")]
    Cancelled,
    #[error("circuit '{endpoint}' is open (retry in {retry_in_ms}ms)")]
    CircuitOpen { endpoint: String, retry_in_ms: u64 },
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("no route reached {0}")]
    Unreachable(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, FetchError::CircuitOpen { .. })
    }

    /// Whether this outcome should be charged against a circuit breaker.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, FetchError::Cancelled | FetchError::CircuitOpen { .. })
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Parse(e.to_string())
    }
}

impl From<quick_xml::Error> for FetchError {
    fn from(e: quick_xml::Error) -> Self {
        FetchError::Parse(e.to_string())
    }
}

/// The one error the proxy gateway can return: every other failure degrades
/// to "no data".
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("request cancelled")]
pub struct Cancelled;

impl From<Cancelled> for FetchError {
    fn from(_: Cancelled) -> Self {
        FetchError::Cancelled
    }
}

/// Handler-boundary error for the mirror endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Upstream(String),
}

impl From<FetchError> for ApiError {
    fn from(e: FetchError) -> Self {
        ApiError::Upstream(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "mirror handler failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_and_open_circuit_are_not_failures() {
        assert!(!FetchError::Cancelled.counts_as_failure());
        assert!(!FetchError::CircuitOpen {
            endpoint: "rss:bbc".into(),
            retry_in_ms: 10
        }
        .counts_as_failure());
        assert!(FetchError::Network("reset".into()).counts_as_failure());
        assert!(FetchError::Parse("bad".into()).counts_as_failure());
    }

    #[test]
    fn gateway_cancellation_converts() {
        let e: FetchError = Cancelled.into();
        assert!(e.is_cancelled());
    }
}
