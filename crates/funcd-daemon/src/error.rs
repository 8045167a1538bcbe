// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime error type and the daemon status contract.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{ProtocolError, Response};

/// Errors from container runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// Socket or framing failure. Never retried automatically.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Any other non-success status, with the daemon's message.
    #[error("Daemon returned {status}: {message}")]
    Daemon { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out after {waited:?} waiting for container {container_id}")]
    WaitTimeout {
        container_id: String,
        waited: Duration,
    },

    #[error("Image build failed: {0}")]
    BuildFailed(String),

    #[error("Image pull failed: {0}")]
    PullFailed(String),

    #[error("Image already exists: {0}")]
    ImageExists(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),
}

impl RuntimeError {
    /// 5xx daemon errors may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Daemon { status, .. } if *status >= 500)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RuntimeError::Conflict(_))
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Apply the status contract: 2xx and 304 pass, 404 and 409 get their own variants.
pub(crate) fn check_status(response: Response, subject: &str) -> Result<Response> {
    if response.is_success() {
        return Ok(response);
    }
    match response.status {
        404 => Err(RuntimeError::NotFound(subject.to_string())),
        409 => Err(RuntimeError::Conflict(daemon_message(&response))),
        status => Err(RuntimeError::Daemon {
            status,
            message: daemon_message(&response),
        }),
    }
}

/// The daemon's `{"message": ...}` text, or the raw body.
pub(crate) fn daemon_message(response: &Response) -> String {
    response
        .json::<serde_json::Value>()
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("cause"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| response.text().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_response;

    fn response(raw: &str) -> Response {
        parse_response(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_status_contract() {
        assert!(check_status(response("HTTP/1.1 204 No Content\r\n\r\n"), "c").is_ok());
        assert!(check_status(response("HTTP/1.1 304 Not Modified\r\n\r\n"), "c").is_ok());

        let err = check_status(response("HTTP/1.1 404 Not Found\r\n\r\n"), "abc").unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(ref s) if s == "abc"));

        let err = check_status(
            response("HTTP/1.1 409 Conflict\r\n\r\n{\"message\":\"name in use\"}"),
            "c",
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Conflict(ref m) if m == "name in use"));
    }

    #[test]
    fn test_server_errors_are_transient() {
        let err = check_status(
            response("HTTP/1.1 503 Service Unavailable\r\n\r\nbusy"),
            "c",
        )
        .unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, RuntimeError::Daemon { status: 503, ref message } if message == "busy"));

        let err = check_status(response("HTTP/1.1 400 Bad Request\r\n\r\n"), "c").unwrap_err();
        assert!(!err.is_transient());
    }
}
