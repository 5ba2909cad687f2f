//! Registry and pending-request table behind a single lock.
//!
//! Both maps live in one `BridgeState` guarded by one mutex, so a handler that
//! touches both (unregister cascade, submit, resolve) runs to completion
//! before any other handler observes either map. Lock order is always
//! state, then hub; the hub never reaches back into the state.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::BridgeError,
    hub::{ConnectionHub, ConnectionId},
    pending::{Outcome, PendingKey, PendingResponse, PendingTable, RequestKind},
    protocol::{BridgeMessage, ConsoleLevel},
    session::{AppType, ConsoleEntry, Session, SessionRegistry},
};

/// What a correlated request asks the add-in to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Execute { code: String },
    Export,
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Execute { .. } => RequestKind::Execute,
            Self::Export => RequestKind::Export,
        }
    }

    fn into_message(self, id: String, timeout: Duration) -> BridgeMessage {
        match self {
            Self::Execute { code } => BridgeMessage::Execute {
                id,
                code,
                timeout: Some(timeout.as_millis() as u64),
            },
            Self::Export => BridgeMessage::ExportRequest { id },
        }
    }
}

pub struct BridgeState {
    pub registry: SessionRegistry,
    pub pending: PendingTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteResult {
    pub request_id: String,
    pub result: Value,
}

#[derive(Clone)]
pub struct Bridge {
    state: Arc<Mutex<BridgeState>>,
    hub: Arc<ConnectionHub>,
    request_counter: Arc<AtomicU64>,
}

impl Bridge {
    pub fn new(hub: Arc<ConnectionHub>, console_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BridgeState {
                registry: SessionRegistry::new(console_capacity),
                pending: PendingTable::new(),
            })),
            hub,
            request_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// Creates a session for `connection` and acknowledges it with
    /// `registered`. Re-registering a connection replaces its old session and
    /// fails that session's pending requests.
    pub async fn register(
        &self,
        connection: ConnectionId,
        app_type: AppType,
        name: String,
        url: Option<String>,
    ) -> String {
        let mut state = self.state.lock().await;
        let (session_id, replaced) =
            state
                .registry
                .register(connection, app_type, name.clone(), url.clone());

        if let Some(previous) = replaced {
            let failed = state.pending.cancel_all_for(
                &previous.id,
                &BridgeError::connection_lost("session was re-registered"),
            );
            info!(
                %connection,
                previous_session = %previous.id,
                failed_requests = failed,
                "connection re-registered; previous session replaced"
            );
        }

        info!(
            %connection,
            session_id = %session_id,
            app_type = %app_type,
            name = %name,
            url = url.as_deref().unwrap_or(""),
            "session registered"
        );

        let ack = BridgeMessage::Registered {
            session_id: session_id.clone(),
        };
        if !self.hub.send_json(connection, &ack).await {
            warn!(%connection, session_id = %session_id, "could not acknowledge registration");
        }

        session_id
    }

    /// Removes the session bound to `connection` and fails all of its pending
    /// requests with `ConnectionLost` before returning.
    pub async fn unregister(&self, connection: ConnectionId) -> Option<Session> {
        let mut state = self.state.lock().await;
        let removed = state.registry.unregister(connection)?;
        let failed = state.pending.cancel_all_for(
            &removed.id,
            &BridgeError::connection_lost("add-in connection closed"),
        );

        info!(
            %connection,
            session_id = %removed.id,
            app_type = %removed.app_type,
            failed_requests = failed,
            "session unregistered"
        );

        Some(removed)
    }

    pub async fn lookup_by_connection(&self, connection: ConnectionId) -> Option<String> {
        let state = self.state.lock().await;
        state
            .registry
            .lookup_by_connection(connection)
            .map(str::to_string)
    }

    pub async fn list(&self, app_type: Option<AppType>) -> Vec<Session> {
        self.state.lock().await.registry.list(app_type)
    }

    pub async fn session(&self, session_id: &str) -> Option<Session> {
        self.state.lock().await.registry.get(session_id).cloned()
    }

    pub async fn console_history(
        &self,
        session_id: &str,
    ) -> Result<Vec<ConsoleEntry>, BridgeError> {
        let state = self.state.lock().await;
        let session = state
            .registry
            .get(session_id)
            .ok_or_else(|| BridgeError::session_not_found(session_id))?;
        Ok(session.console.iter().cloned().collect())
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.registry.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Sends a correlated request to the session's add-in and returns a
    /// handle that completes when the matching response arrives, the deadline
    /// elapses, or the session disconnects.
    ///
    /// Unknown sessions fail immediately and nothing is sent.
    pub async fn submit(
        &self,
        session_id: &str,
        request_id: Option<String>,
        payload: RequestPayload,
        timeout: Duration,
    ) -> Result<PendingResponse, BridgeError> {
        let mut state = self.state.lock().await;

        let connection = state
            .registry
            .get(session_id)
            .map(|session| session.connection)
            .ok_or_else(|| BridgeError::session_not_found(session_id))?;

        let request_id = request_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| self.next_request_id());
        let key = PendingKey::new(session_id, payload.kind(), &request_id);
        let (seq, response) = state.pending.insert(key.clone())?;

        let message = payload.into_message(request_id.clone(), timeout);
        if !self.hub.send_json(connection, &message).await {
            state.pending.discard(&key);
            return Err(BridgeError::connection_lost(
                "add-in connection is not writable",
            ));
        }

        let timer_state = Arc::clone(&self.state);
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = timer_state.lock().await;
            if state.pending.expire(&timer_key, seq, timeout) {
                warn!(
                    session_id = %timer_key.session_id,
                    kind = %timer_key.kind,
                    request_id = %timer_key.request_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
            }
        });
        state.pending.attach_timer(&key, seq, timer.abort_handle());

        debug!(
            session_id,
            kind = %key.kind,
            request_id = %request_id,
            timeout_ms = timeout.as_millis() as u64,
            "request submitted"
        );

        Ok(response)
    }

    /// Completes the pending request for the exact key, if any. Unknown,
    /// expired and already-resolved keys are ignored.
    pub async fn resolve(
        &self,
        session_id: &str,
        kind: RequestKind,
        request_id: &str,
        outcome: Outcome,
    ) -> bool {
        let mut state = self.state.lock().await;
        Self::resolve_locked(
            &mut state,
            &PendingKey::new(session_id, kind, request_id),
            outcome,
        )
    }

    /// Resolves a response that arrived on `connection`; the connection
    /// identifies the session.
    pub async fn resolve_for_connection(
        &self,
        connection: ConnectionId,
        kind: RequestKind,
        request_id: &str,
        outcome: Outcome,
    ) -> Result<bool, BridgeError> {
        let mut state = self.state.lock().await;
        let session_id = state
            .registry
            .lookup_by_connection(connection)
            .map(str::to_string)
            .ok_or_else(|| {
                BridgeError::Protocol(format!("{kind} response from unregistered connection"))
            })?;
        state.registry.touch(connection);

        Ok(Self::resolve_locked(
            &mut state,
            &PendingKey::new(&session_id, kind, request_id),
            outcome,
        ))
    }

    fn resolve_locked(state: &mut BridgeState, key: &PendingKey, outcome: Outcome) -> bool {
        let age_ms = state
            .pending
            .age(key)
            .map(|age| age.as_millis() as u64);

        if state.pending.resolve(key, outcome) {
            debug!(
                session_id = %key.session_id,
                kind = %key.kind,
                request_id = %key.request_id,
                elapsed_ms = age_ms.unwrap_or_default(),
                "request resolved"
            );
            true
        } else {
            warn!(
                session_id = %key.session_id,
                kind = %key.kind,
                request_id = %key.request_id,
                "dropping response for unknown or expired request"
            );
            false
        }
    }

    /// Records a console line from `connection` and returns the owning
    /// session, if registered.
    pub async fn record_console(
        &self,
        connection: ConnectionId,
        level: ConsoleLevel,
        message: String,
    ) -> Option<(String, AppType)> {
        let mut state = self.state.lock().await;
        let session_id = state.registry.lookup_by_connection(connection)?.to_string();
        state.registry.touch(connection);
        state.registry.push_console(connection, level, message);
        let app_type = state.registry.get(&session_id)?.app_type;
        Some((session_id, app_type))
    }

    /// Runs `code` in the session's host application and waits for its result.
    pub async fn execute(
        &self,
        session_id: &str,
        request_id: Option<String>,
        code: String,
        timeout: Duration,
    ) -> Result<ExecuteResult, BridgeError> {
        let response = self
            .submit(
                session_id,
                request_id,
                RequestPayload::Execute { code },
                timeout,
            )
            .await?;
        let request_id = response.request_id().to_string();
        let result = response.wait().await?;
        Ok(ExecuteResult { request_id, result })
    }

    /// Asks the session's add-in for its document and returns the decoded
    /// bytes.
    pub async fn export_document(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, BridgeError> {
        let response = self
            .submit(session_id, None, RequestPayload::Export, timeout)
            .await?;
        let payload = response.wait().await?;

        let encoded = payload
            .as_str()
            .ok_or_else(|| BridgeError::Export("export payload is not a string".to_string()))?;
        STANDARD
            .decode(encoded.trim())
            .map_err(|error| BridgeError::Export(format!("invalid base64 payload: {error}")))
    }

    fn next_request_id(&self) -> String {
        format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            self.request_counter.fetch_add(1, Ordering::Relaxed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn connect(bridge: &Bridge) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = bridge.hub().add_connection(tx).await;
        (connection, rx)
    }

    async fn register_word(
        bridge: &Bridge,
        name: &str,
    ) -> (String, ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (connection, mut rx) = connect(bridge).await;
        let session_id = bridge
            .register(connection, AppType::Word, name.to_string(), None)
            .await;

        let ack: Value = serde_json::from_str(&rx.recv().await.expect("ack")).expect("json");
        assert_eq!(ack["type"], "registered");
        assert_eq!(ack["sessionId"], session_id.as_str());

        (session_id, connection, rx)
    }

    fn next_message(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().expect("message sent")).expect("json")
    }

    fn new_bridge() -> Bridge {
        Bridge::new(Arc::new(ConnectionHub::new()), 50)
    }

    #[tokio::test(start_paused = true)]
    async fn execute_resolves_with_remote_result() {
        let bridge = new_bridge();
        let (s1, _conn, mut rx) = register_word(&bridge, "contract.docx").await;

        let response = bridge
            .submit(
                &s1,
                Some("r1".into()),
                RequestPayload::Execute {
                    code: "return 1 + 1;".into(),
                },
                Duration::from_millis(5000),
            )
            .await
            .expect("submit");

        let sent = next_message(&mut rx);
        assert_eq!(sent["type"], "execute");
        assert_eq!(sent["id"], "r1");
        assert_eq!(sent["timeout"], 5000);

        let resolver = bridge.clone();
        let session = s1.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            resolver
                .resolve(&session, RequestKind::Execute, "r1", Ok(json!(2)))
                .await;
        });

        assert_eq!(response.wait().await, Ok(json!(2)));
        assert_eq!(bridge.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_session_fails_fast_without_sending() {
        let bridge = new_bridge();
        let (_s1, _conn, mut rx) = register_word(&bridge, "contract.docx").await;

        let error = bridge
            .submit(
                "nope",
                Some("r2".into()),
                RequestPayload::Execute { code: "1".into() },
                Duration::from_millis(5000),
            )
            .await
            .expect_err("unknown session");

        assert_eq!(error, BridgeError::session_not_found("nope"));
        assert!(rx.try_recv().is_err());
        assert_eq!(bridge.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_and_late_result_is_dropped() {
        let bridge = new_bridge();
        let (s1, _conn, _rx) = register_word(&bridge, "contract.docx").await;

        let started = tokio::time::Instant::now();
        let response = bridge
            .submit(
                &s1,
                Some("r3".into()),
                RequestPayload::Execute { code: "1".into() },
                Duration::from_millis(100),
            )
            .await
            .expect("submit");

        let error = response.wait().await.expect_err("timeout");
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(
            error,
            BridgeError::RequestTimeout {
                request_id: "r3".into(),
                timeout_ms: 100
            }
        );

        assert!(
            !bridge
                .resolve(&s1, RequestKind::Execute, "r3", Ok(json!("late")))
                .await
        );
        assert_eq!(bridge.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_resolve_independently() {
        let bridge = new_bridge();
        let (s1, _conn, _rx) = register_word(&bridge, "contract.docx").await;

        let submit = |id: &'static str| {
            let bridge = bridge.clone();
            let s1 = s1.clone();
            async move {
                bridge
                    .submit(
                        &s1,
                        Some(id.into()),
                        RequestPayload::Execute { code: id.into() },
                        Duration::from_secs(5),
                    )
                    .await
                    .expect("submit")
            }
        };
        let a = submit("rA").await;
        let b = submit("rB").await;

        assert!(bridge.resolve(&s1, RequestKind::Execute, "rB", Ok(json!("b"))).await);
        let mut a_wait = Box::pin(a.wait());
        assert!((&mut a_wait).now_or_never().is_none());
        assert_eq!(b.wait().await, Ok(json!("b")));

        assert!(bridge.resolve(&s1, RequestKind::Execute, "rA", Ok(json!("a"))).await);
        assert_eq!(a_wait.await, Ok(json!("a")));
    }

    #[tokio::test]
    async fn resolve_twice_only_applies_first() {
        let bridge = new_bridge();
        let (s1, _conn, _rx) = register_word(&bridge, "contract.docx").await;
        let response = bridge
            .submit(
                &s1,
                Some("r1".into()),
                RequestPayload::Execute { code: "1".into() },
                Duration::from_secs(5),
            )
            .await
            .expect("submit");

        assert!(bridge.resolve(&s1, RequestKind::Execute, "r1", Ok(json!(1))).await);
        assert!(
            !bridge
                .resolve(
                    &s1,
                    RequestKind::Execute,
                    "r1",
                    Err(BridgeError::RemoteExecution {
                        message: "second".into(),
                        stack: None
                    })
                )
                .await
        );
        assert_eq!(response.wait().await, Ok(json!(1)));
    }

    #[tokio::test]
    async fn unregister_fails_pending_before_returning() {
        let bridge = new_bridge();
        let (s1, conn, _rx) = register_word(&bridge, "contract.docx").await;
        let (s2, _other_conn, _other_rx) = register_word(&bridge, "other.docx").await;

        let exec = bridge
            .submit(
                &s1,
                None,
                RequestPayload::Execute { code: "1".into() },
                Duration::from_secs(5),
            )
            .await
            .expect("submit execute");
        let export = bridge
            .submit(&s1, None, RequestPayload::Export, Duration::from_secs(5))
            .await
            .expect("submit export");
        let survivor = bridge
            .submit(
                &s2,
                Some("keep".into()),
                RequestPayload::Execute { code: "1".into() },
                Duration::from_secs(5),
            )
            .await
            .expect("submit survivor");

        let removed = bridge.unregister(conn).await.expect("session removed");
        assert_eq!(removed.id, s1);

        let lost = BridgeError::connection_lost("add-in connection closed");
        assert_eq!(exec.wait().now_or_never(), Some(Err(lost.clone())));
        assert_eq!(export.wait().now_or_never(), Some(Err(lost)));
        assert_eq!(bridge.pending_count().await, 1);

        assert!(bridge.resolve(&s2, RequestKind::Execute, "keep", Ok(json!(true))).await);
        assert_eq!(survivor.wait().await, Ok(json!(true)));
    }

    #[tokio::test]
    async fn reregistration_replaces_session_and_fails_its_requests() {
        let bridge = new_bridge();
        let (s1, conn, mut rx) = register_word(&bridge, "draft.docx").await;
        let pending = bridge
            .submit(
                &s1,
                None,
                RequestPayload::Execute { code: "1".into() },
                Duration::from_secs(5),
            )
            .await
            .expect("submit");
        let _execute = next_message(&mut rx);

        let s2 = bridge
            .register(conn, AppType::Word, "final.docx".into(), None)
            .await;
        assert_ne!(s1, s2);
        assert!(matches!(
            pending.wait().now_or_never(),
            Some(Err(BridgeError::ConnectionLost { .. }))
        ));
        assert!(bridge.session(&s1).await.is_none());
        assert_eq!(bridge.lookup_by_connection(conn).await, Some(s2));
    }

    #[tokio::test]
    async fn closed_writer_reports_connection_lost() {
        let bridge = new_bridge();
        let (s1, _conn, rx) = register_word(&bridge, "contract.docx").await;
        drop(rx);

        let error = bridge
            .submit(
                &s1,
                None,
                RequestPayload::Execute { code: "1".into() },
                Duration::from_secs(5),
            )
            .await
            .expect_err("writer closed");
        assert!(matches!(error, BridgeError::ConnectionLost { .. }));
        assert_eq!(bridge.pending_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_request_id_is_rejected_without_sending() {
        let bridge = new_bridge();
        let (s1, _conn, mut rx) = register_word(&bridge, "contract.docx").await;
        let _first = bridge
            .submit(
                &s1,
                Some("dup".into()),
                RequestPayload::Execute { code: "1".into() },
                Duration::from_secs(5),
            )
            .await
            .expect("first submit");
        let _execute = next_message(&mut rx);

        let error = bridge
            .submit(
                &s1,
                Some("dup".into()),
                RequestPayload::Execute { code: "2".into() },
                Duration::from_secs(5),
            )
            .await
            .expect_err("duplicate");
        assert_eq!(
            error,
            BridgeError::DuplicateRequest {
                request_id: "dup".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn export_document_decodes_base64_payload() {
        let bridge = new_bridge();
        let (s1, _conn, mut rx) = register_word(&bridge, "contract.docx").await;

        let worker = bridge.clone();
        let session = s1.clone();
        let handle = tokio::spawn(async move {
            worker
                .export_document(&session, Duration::from_secs(5))
                .await
        });

        let request = loop {
            if let Some(text) = rx.recv().await {
                break serde_json::from_str::<Value>(&text).expect("json");
            }
        };
        assert_eq!(request["type"], "exportRequest");
        let id = request["id"].as_str().expect("id").to_string();

        // Same id on the execute side must not satisfy the export.
        assert!(!bridge.resolve(&s1, RequestKind::Execute, &id, Ok(json!("x"))).await);
        assert!(
            bridge
                .resolve(&s1, RequestKind::Export, &id, Ok(json!("JVBERi0xLjc=")))
                .await
        );

        let bytes = handle.await.expect("join").expect("export");
        assert_eq!(bytes, b"%PDF-1.7".to_vec());
    }

    #[tokio::test]
    async fn list_filters_and_keeps_insertion_order() {
        let bridge = new_bridge();
        let (a, _, _rx_a) = register_word(&bridge, "a.docx").await;
        let (conn_b, _rx_b) = connect(&bridge).await;
        let _b = bridge
            .register(conn_b, AppType::Excel, "b.xlsx".into(), None)
            .await;
        let (c, _, _rx_c) = register_word(&bridge, "c.docx").await;

        let words = bridge
            .list(Some(AppType::Word))
            .await
            .into_iter()
            .map(|s| s.id)
            .collect::<Vec<_>>();
        assert_eq!(words, vec![a, c]);
        assert_eq!(bridge.list(None).await.len(), 3);
    }
}
