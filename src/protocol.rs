//! Messages exchanged with add-ins over the persistent connection.
//!
//! Every frame is a JSON object discriminated by its `type` field. Code and
//! result payloads are opaque to the bridge.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::AppType;

/// Frames sent by an add-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AddinMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        app_type: AppType,
        #[serde(default)]
        name: String,
        #[serde(default)]
        url: Option<String>,
    },
    Result {
        id: String,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<RemoteError>,
    },
    #[serde(rename_all = "camelCase")]
    ExportResult {
        id: String,
        success: bool,
        #[serde(default, alias = "payload", alias = "data")]
        payload_base64: Option<String>,
        #[serde(default)]
        error: Option<RemoteError>,
    },
    Console {
        #[serde(default)]
        level: ConsoleLevel,
        #[serde(default, alias = "text")]
        message: String,
    },
}

/// Frames sent by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeMessage {
    #[serde(rename_all = "camelCase")]
    Registered { session_id: String },
    Execute {
        id: String,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
    ExportRequest { id: String },
}

/// Failure reported by the add-in.
///
/// Add-ins send `{ "message": .., "stack": .. }`, a bare string, or whatever
/// error object the host runtime produced (`{ "code": .. }` and the like).
/// Anything that is not one of the first two shapes lands in `Other` so the
/// failure still reaches the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteError {
    Detailed {
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
    Text(String),
    Other(Value),
}

impl RemoteError {
    /// Splits into message and stack, using `fallback` when the add-in did
    /// not say what went wrong.
    pub fn into_parts(self, fallback: &str) -> (String, Option<String>) {
        match self {
            Self::Detailed { message, stack } => (message, stack),
            Self::Text(message) => (message, None),
            Self::Other(value) => {
                let field = |name: &str| {
                    value.get(name).and_then(Value::as_str).map(str::to_string)
                };
                let message = match (field("message"), field("code")) {
                    (Some(message), _) => message,
                    (None, Some(code)) => format!("{fallback}: {code}"),
                    (None, None) => fallback.to_string(),
                };
                (message, field("stack"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    #[default]
    Log,
    Debug,
    Info,
    Warn,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_register_without_url() {
        let message: AddinMessage =
            serde_json::from_str(r#"{"type":"register","appType":"word","name":"contract.docx"}"#)
                .expect("parse register");
        assert_eq!(
            message,
            AddinMessage::Register {
                app_type: AppType::Word,
                name: "contract.docx".into(),
                url: None,
            }
        );
    }

    #[test]
    fn parses_result_with_string_error() {
        let message: AddinMessage = serde_json::from_value(json!({
            "type": "result",
            "id": "r1",
            "success": false,
            "error": "Range is locked"
        }))
        .expect("parse result");

        let AddinMessage::Result { error, success, .. } = message else {
            panic!("expected result");
        };
        assert!(!success);
        assert_eq!(
            error.map(|error| error.into_parts("failed")),
            Some(("Range is locked".to_string(), None))
        );
    }

    #[test]
    fn tolerates_error_objects_without_message() {
        let message: AddinMessage = serde_json::from_value(json!({
            "type": "result",
            "id": "r1",
            "success": false,
            "error": { "code": "InvalidArgument" }
        }))
        .expect("parse result");

        let AddinMessage::Result { error, .. } = message else {
            panic!("expected result");
        };
        assert_eq!(
            error.map(|error| error.into_parts("remote execution failed")),
            Some(("remote execution failed: InvalidArgument".to_string(), None))
        );
    }

    #[test]
    fn tolerates_non_string_stack() {
        let error: RemoteError =
            serde_json::from_value(json!({ "message": "boom", "stack": ["at a", "at b"] }))
                .expect("parse error");
        assert_eq!(error.into_parts("failed"), ("boom".to_string(), None));
    }

    #[test]
    fn parses_export_result_payload_alias() {
        let message: AddinMessage = serde_json::from_value(json!({
            "type": "exportResult",
            "id": "e1",
            "success": true,
            "payload": "JVBERi0="
        }))
        .expect("parse export result");

        let AddinMessage::ExportResult { payload_base64, .. } = message else {
            panic!("expected export result");
        };
        assert_eq!(payload_base64.as_deref(), Some("JVBERi0="));
    }

    #[test]
    fn console_level_defaults_to_log() {
        let message: AddinMessage =
            serde_json::from_str(r#"{"type":"console","message":"ready"}"#).expect("parse console");
        assert_eq!(
            message,
            AddinMessage::Console {
                level: ConsoleLevel::Log,
                message: "ready".into(),
            }
        );
    }

    #[test]
    fn execute_omits_missing_timeout() {
        let value = serde_json::to_value(BridgeMessage::Execute {
            id: "r1".into(),
            code: "return 1 + 1;".into(),
            timeout: None,
        })
        .expect("serialize execute");
        assert_eq!(
            value,
            json!({ "type": "execute", "id": "r1", "code": "return 1 + 1;" })
        );
    }

    #[test]
    fn registered_uses_camel_case_session_id() {
        let value = serde_json::to_value(BridgeMessage::Registered {
            session_id: "word-1".into(),
        })
        .expect("serialize registered");
        assert_eq!(value, json!({ "type": "registered", "sessionId": "word-1" }));
    }

    #[test]
    fn rejects_unknown_type() {
        let parsed = serde_json::from_str::<AddinMessage>(r#"{"type":"teleport"}"#);
        assert!(parsed.is_err());
    }
}
