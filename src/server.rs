//! HTTP and WebSocket surface.
//!
//! `/addin` is the persistent connection used by office add-ins; everything
//! under `/api` is the short-lived call surface for automation clients.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, Request, State,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info, warn};

use crate::{
    bridge::Bridge,
    config::BridgeConfig,
    dispatch,
    error::BridgeError,
    export::{self, PageImage, PageRasterizer},
    session::{AppType, ConsoleEntry, Session},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    /// Port actually bound, which differs from the configured one when it is 0.
    pub port: u16,
    pub started_at: Instant,
    pub bridge: Bridge,
    pub rasterizer: Arc<dyn PageRasterizer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/addin", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/info", get(info_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/sessions/{id}/console", get(console_handler))
        .route("/api/execute", post(execute_handler))
        .route("/api/pages", post(pages_handler))
        .route("/api/documents", get(legacy_documents_handler))
        .route("/api/documents/execute", post(execute_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_trusted_peer,
        ))
        .with_state(state)
}

/// Serves the router on `listener` until the process exits.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn require_trusted_peer(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.is_trusted_peer(peer.ip()) {
        warn!(%peer, path = %request.uri().path(), "refusing non-local peer");
        return BridgeError::Forbidden("The bridge only accepts local connections".to_string())
            .into_response();
    }

    next.run(request).await
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "at": Utc::now().to_rfc3339(),
        "uptimeSec": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    port: u16,
    active_session_count: usize,
    pending_request_count: usize,
}

async fn info_handler(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        port: state.port,
        active_session_count: state.bridge.session_count().await,
        pending_request_count: state.bridge.pending_count().await,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    app_type: Option<String>,
}

async fn list_sessions_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Session>>, BridgeError> {
    let filter = match query.app_type.as_deref() {
        Some(raw) if !raw.trim().is_empty() => Some(
            raw.parse::<AppType>()
                .map_err(|error| BridgeError::invalid_params(&error))?,
        ),
        _ => None,
    };

    Ok(Json(state.bridge.list(filter).await))
}

async fn console_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<ConsoleEntry>>, BridgeError> {
    Ok(Json(state.bridge.console_history(&session_id).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LegacyDocument {
    document_id: String,
    #[serde(flatten)]
    session: Session,
}

/// Older clients only knew about Word and called sessions "documents".
async fn legacy_documents_handler(State(state): State<AppState>) -> Json<Vec<LegacyDocument>> {
    let documents = state
        .bridge
        .list(Some(AppType::Word))
        .await
        .into_iter()
        .map(|session| LegacyDocument {
            document_id: session.id.clone(),
            session,
        })
        .collect();
    Json(documents)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest {
    #[serde(alias = "documentId")]
    session_id: String,
    code: String,
    timeout: Option<u64>,
    request_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    request_id: String,
    result: Value,
}

async fn execute_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<ExecuteResponse>, BridgeError> {
    let request: ExecuteRequest = parse_body(body)?;
    if request.code.trim().is_empty() {
        return Err(BridgeError::invalid_params("code must not be empty"));
    }

    let timeout = state
        .config
        .clamp_timeout(request.timeout, state.config.exec_timeout_ms);
    let outcome = state
        .bridge
        .execute(&request.session_id, request.request_id, request.code, timeout)
        .await?;

    Ok(Json(ExecuteResponse {
        request_id: outcome.request_id,
        result: outcome.result,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PagesRequest {
    #[serde(alias = "documentId")]
    session_id: String,
    scale: Option<f32>,
    pages: Option<Vec<u32>>,
    timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PagesResponse {
    session_id: String,
    total_pages: u32,
    pages: Vec<PageImage>,
}

async fn pages_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<PagesResponse>, BridgeError> {
    let request: PagesRequest = parse_body(body)?;
    let timeout = state
        .config
        .clamp_timeout(request.timeout, state.config.export_timeout_ms);

    let rendered = export::export_pages(
        &state.bridge,
        state.rasterizer.as_ref(),
        &request.session_id,
        request.scale,
        request.pages.as_deref(),
        timeout,
    )
    .await?;

    Ok(Json(PagesResponse {
        session_id: request.session_id,
        total_pages: rendered.total_pages,
        pages: rendered.pages,
    }))
}

fn parse_body<T: DeserializeOwned>(body: Value) -> Result<T, BridgeError> {
    serde_json::from_value(body).map_err(|error| BridgeError::invalid_params(&error.to_string()))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

/// Lifecycle of one add-in connection: open, registered, closed. Closing
/// always runs the unregister cascade.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut socket_tx, mut socket_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let hub = state.bridge.hub().clone();
    let connection = hub.add_connection(tx).await;
    info!(%connection, "add-in connected");

    let writer_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if socket_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = socket_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Err(error) =
                    dispatch::handle_addin_text(&state.bridge, connection, text.as_str()).await
                {
                    warn!(%connection, %error, "ignoring add-in message");
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(%connection, "binary frames are not supported; ignoring");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                debug!(%connection, "keepalive");
            }
            Err(error) => {
                warn!(%connection, %error, "add-in websocket error");
                break;
            }
        }
    }

    state.bridge.unregister(connection).await;
    hub.remove_connection(connection).await;
    writer_task.abort();
    info!(%connection, "add-in disconnected");
}
