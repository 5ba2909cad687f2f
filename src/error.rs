//! Bridge error taxonomy.
//!
//! The four correlation errors (`SessionNotFound`, `RequestTimeout`,
//! `RemoteExecution`, `ConnectionLost`) are surfaced to the external caller.
//! `Protocol` never leaves the dispatch loop.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
pub const REMOTE_EXECUTION_ERROR: &str = "REMOTE_EXECUTION_ERROR";
pub const CONNECTION_LOST: &str = "CONNECTION_LOST";
pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
pub const DUPLICATE_REQUEST: &str = "DUPLICATE_REQUEST";
pub const EXPORT_FAILED: &str = "EXPORT_FAILED";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
pub const FORBIDDEN: &str = "FORBIDDEN";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The session id was not registered when the request was submitted.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// No response arrived before the deadline.
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: String, timeout_ms: u64 },

    /// The add-in answered with an explicit failure.
    #[error("{message}")]
    RemoteExecution {
        message: String,
        stack: Option<String>,
    },

    /// The session's connection closed while the request was pending.
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// Malformed or unrecognized inbound message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    InvalidParams(String),

    /// The `(session, kind, request id)` key is already in flight.
    #[error("request {request_id} is already pending")]
    DuplicateRequest { request_id: String },

    #[error("export failed: {0}")]
    Export(String),

    #[error("{0}")]
    Internal(String),

    /// The peer is not allowed to talk to the bridge.
    #[error("{0}")]
    Forbidden(String),
}

impl BridgeError {
    pub fn session_not_found(session_id: &str) -> Self {
        Self::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }

    pub fn connection_lost(reason: &str) -> Self {
        Self::ConnectionLost {
            reason: reason.to_string(),
        }
    }

    pub fn invalid_params(message: &str) -> Self {
        Self::InvalidParams(message.to_string())
    }

    /// Machine-readable code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound { .. } => SESSION_NOT_FOUND,
            Self::RequestTimeout { .. } => REQUEST_TIMEOUT,
            Self::RemoteExecution { .. } => REMOTE_EXECUTION_ERROR,
            Self::ConnectionLost { .. } => CONNECTION_LOST,
            Self::Protocol(_) => PROTOCOL_ERROR,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::DuplicateRequest { .. } => DUPLICATE_REQUEST,
            Self::Export(_) => EXPORT_FAILED,
            Self::Internal(_) => INTERNAL_ERROR,
            Self::Forbidden(_) => FORBIDDEN,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            Self::RequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::RemoteExecution { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ConnectionLost { .. } => StatusCode::BAD_GATEWAY,
            Self::Protocol(_) | Self::InvalidParams(_) => StatusCode::BAD_REQUEST,
            Self::DuplicateRequest { .. } => StatusCode::CONFLICT,
            Self::Export(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }

    /// Wire-format error body.
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });

        if let Self::RemoteExecution {
            stack: Some(stack), ..
        } = self
        {
            body["error"]["stack"] = Value::String(stack.clone());
        }

        body
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_errors_have_distinct_codes() {
        let errors = [
            BridgeError::session_not_found("s1"),
            BridgeError::RequestTimeout {
                request_id: "r1".into(),
                timeout_ms: 100,
            },
            BridgeError::RemoteExecution {
                message: "boom".into(),
                stack: None,
            },
            BridgeError::connection_lost("closed"),
        ];

        let mut codes = errors.iter().map(BridgeError::code).collect::<Vec<_>>();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 4);
    }

    #[test]
    fn remote_error_body_carries_stack() {
        let error = BridgeError::RemoteExecution {
            message: "ReferenceError: x is not defined".into(),
            stack: Some("at eval:1:1".into()),
        };
        let body = error.to_body();
        assert_eq!(body["error"]["code"], REMOTE_EXECUTION_ERROR);
        assert_eq!(body["error"]["message"], "ReferenceError: x is not defined");
        assert_eq!(body["error"]["stack"], "at eval:1:1");
    }

    #[test]
    fn session_not_found_maps_to_404() {
        let error = BridgeError::session_not_found("nope");
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
        assert!(error.to_body()["error"].get("stack").is_none());
    }

    #[test]
    fn forbidden_maps_to_403() {
        let error = BridgeError::Forbidden("local connections only".into());
        assert_eq!(error.status(), StatusCode::FORBIDDEN);
        assert_eq!(error.to_body()["error"]["code"], FORBIDDEN);
        assert_eq!(error.to_body()["error"]["message"], "local connections only");
    }
}
