//! Inbound add-in message handling.
//!
//! Every text frame from an add-in connection goes through
//! [`handle_addin_text`]. Errors returned from here are protocol errors for
//! the socket loop to log; they never close the connection and never touch
//! another session's state.

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    bridge::Bridge,
    error::BridgeError,
    hub::ConnectionId,
    pending::{Outcome, RequestKind},
    protocol::{AddinMessage, ConsoleLevel, RemoteError},
};

pub async fn handle_addin_text(
    bridge: &Bridge,
    connection: ConnectionId,
    text: &str,
) -> Result<(), BridgeError> {
    let message = serde_json::from_str::<AddinMessage>(text)
        .map_err(|error| BridgeError::Protocol(format!("unrecognized message: {error}")))?;

    handle_addin_message(bridge, connection, message).await
}

pub async fn handle_addin_message(
    bridge: &Bridge,
    connection: ConnectionId,
    message: AddinMessage,
) -> Result<(), BridgeError> {
    match message {
        AddinMessage::Register {
            app_type,
            name,
            url,
        } => {
            bridge.register(connection, app_type, name, url).await;
            Ok(())
        }
        AddinMessage::Result {
            id,
            success,
            result,
            error,
        } => {
            let outcome = if success {
                Ok(result.unwrap_or(Value::Null))
            } else {
                Err(remote_failure(error, "remote execution failed"))
            };
            bridge
                .resolve_for_connection(connection, RequestKind::Execute, &id, outcome)
                .await?;
            Ok(())
        }
        AddinMessage::ExportResult {
            id,
            success,
            payload_base64,
            error,
        } => {
            let outcome: Outcome = match (success, payload_base64) {
                (true, Some(payload)) => Ok(Value::String(payload)),
                (true, None) => Err(BridgeError::Export(
                    "add-in reported success without a payload".to_string(),
                )),
                (false, _) => Err(remote_failure(error, "remote export failed")),
            };
            bridge
                .resolve_for_connection(connection, RequestKind::Export, &id, outcome)
                .await?;
            Ok(())
        }
        AddinMessage::Console { level, message } => {
            let Some((session_id, app_type)) = bridge
                .record_console(connection, level, message.clone())
                .await
            else {
                return Err(BridgeError::Protocol(
                    "console message from unregistered connection".to_string(),
                ));
            };

            match level {
                ConsoleLevel::Error => {
                    error!(target: "addin", %session_id, %app_type, "{message}")
                }
                ConsoleLevel::Warn => warn!(target: "addin", %session_id, %app_type, "{message}"),
                ConsoleLevel::Info | ConsoleLevel::Log => {
                    info!(target: "addin", %session_id, %app_type, "{message}")
                }
                ConsoleLevel::Debug => {
                    debug!(target: "addin", %session_id, %app_type, "{message}")
                }
            }
            Ok(())
        }
    }
}

fn remote_failure(error: Option<RemoteError>, fallback: &str) -> BridgeError {
    let (message, stack) = error
        .map(|error| error.into_parts(fallback))
        .unwrap_or_else(|| (fallback.to_string(), None));
    BridgeError::RemoteExecution { message, stack }
}
