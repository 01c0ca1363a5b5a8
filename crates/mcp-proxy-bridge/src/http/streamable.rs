//! Streamable HTTP ingress.
//!
//! One endpoint carries the whole session. Request POSTs block until the
//! matching response and answer with a single JSON envelope; notification
//! POSTs return 202. In stateful mode the first `initialize` POST creates
//! the session (child included) and hands back an `Mcp-Session-Id` header
//! that later POSTs must echo. In stateless mode every POST spawns, uses
//! and tears down a whole bridge with its own child, which is expensive
//! and the operator's explicit choice.
//!
//! Server-initiated messages that are not the awaited response have no
//! carrier in single-JSON-response mode and are dropped with a log line.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{resolve_server, spawn_child, AppState};
use crate::bridge::{mirror_advertisement, proxy_client_info, Bridge};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{
    JsonRpcResponse, McpMessage, MessageId, METHOD_INITIALIZE, METHOD_INITIALIZED,
};
use crate::session::SessionEndpoint;
use crate::transport::Transport;

/// Session id header of the Streamable HTTP transport.
const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Request POSTs waiting for their response, keyed by message id.
struct PendingResponses {
    // `None` once the transport closed: registrations are refused and
    // waiting POSTs observe their sender dropped.
    waiters: StdMutex<Option<HashMap<MessageId, oneshot::Sender<JsonRpcResponse>>>>,
}

impl PendingResponses {
    fn new() -> Self {
        Self {
            waiters: StdMutex::new(Some(HashMap::new())),
        }
    }

    fn register(&self, id: MessageId) -> Option<oneshot::Receiver<JsonRpcResponse>> {
        let mut guard = self.waiters.lock().expect("waiters lock poisoned");
        let map = guard.as_mut()?;
        let (tx, rx) = oneshot::channel();
        map.insert(id, tx);
        Some(rx)
    }

    fn resolve(&self, response: JsonRpcResponse) -> bool {
        let mut guard = self.waiters.lock().expect("waiters lock poisoned");
        let Some(map) = guard.as_mut() else {
            return false;
        };
        match map.remove(&response.id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        self.waiters.lock().expect("waiters lock poisoned").take();
    }
}

/// Downstream transport for a stateful streamable session: `recv` yields
/// POSTed messages, `send` routes responses back to the blocked POST.
struct StreamableServerTransport {
    inbound: Mutex<mpsc::Receiver<McpMessage>>,
    pending: Arc<PendingResponses>,
    closed: CancellationToken,
}

#[async_trait]
impl Transport for StreamableServerTransport {
    async fn send(&self, message: McpMessage) -> BridgeResult<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::TransportClosed);
        }
        match message {
            McpMessage::Response(response) => {
                if !self.pending.resolve(response) {
                    debug!("Dropping response with no waiting request");
                }
            }
            other => {
                debug!(
                    method = other.method().unwrap_or("-"),
                    "Dropping server-initiated message in single-response mode"
                );
            }
        }
        Ok(())
    }

    async fn recv(&self) -> BridgeResult<Option<McpMessage>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            next = inbound.recv() => Ok(next),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        self.pending.close();
    }
}

/// What a POST handler needs to reach a live session.
#[derive(Clone)]
struct SessionHandle {
    inbound: mpsc::Sender<McpMessage>,
    pending: Arc<PendingResponses>,
}

/// Live stateful sessions keyed by `Mcp-Session-Id`.
#[derive(Default)]
pub(crate) struct StreamableSessions {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl StreamableSessions {
    async fn register(&self, session_id: String, handle: SessionHandle) {
        self.sessions.write().await.insert(session_id.clone(), handle);
        info!(session_id = %session_id, "Streamable HTTP session registered");
    }

    async fn unregister(&self, session_id: &str) {
        if self.sessions.write().await.remove(session_id).is_some() {
            info!(session_id = %session_id, "Streamable HTTP session unregistered");
        }
    }

    async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(session_id).cloned()
    }
}

pub(crate) async fn default_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    serve_mcp(state, None, headers, body).await
}

pub(crate) async fn named_mcp(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    serve_mcp(state, Some(name), headers, body).await
}

async fn serve_mcp(
    state: AppState,
    name: Option<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let server = match resolve_server(&state, name.as_deref()) {
        Ok(server) => server,
        Err(response) => return response,
    };

    let message = match McpMessage::from_json(&body) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Rejecting malformed message");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    if state.stateless {
        return stateless_exchange(&state, &server, &headers, message).await;
    }

    let session_header = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    match session_header {
        Some(session_id) => {
            let Some(handle) = state.streamable_sessions.get(&session_id).await else {
                return (
                    StatusCode::NOT_FOUND,
                    Json(serde_json::json!({ "error": "Session not found" })),
                )
                    .into_response();
            };
            exchange(&handle, Some(&session_id), message).await
        }
        None => {
            // A session starts with initialize; anything else has nowhere
            // to go yet.
            if message.method() != Some(METHOD_INITIALIZE) {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": "Missing Mcp-Session-Id header" })),
                )
                    .into_response();
            }
            match open_session(&state, &server, &headers).await {
                Ok((session_id, handle)) => exchange(&handle, Some(&session_id), message).await,
                Err(response) => response,
            }
        }
    }
}

/// Spawn the child and the bridge backing one stateful session.
async fn open_session(
    state: &AppState,
    server: &Arc<crate::registry::RegisteredServer>,
    headers: &HeaderMap,
) -> Result<(String, SessionHandle), Response> {
    let child = match spawn_child(server, headers) {
        Ok(child) => Arc::new(child),
        Err(e) => {
            warn!(server = %server.entry.name, error = %e, "Failed to spawn child");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response());
        }
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    let (in_tx, in_rx) = mpsc::channel(1);
    let pending = Arc::new(PendingResponses::new());
    let transport: Arc<dyn Transport> = Arc::new(StreamableServerTransport {
        inbound: Mutex::new(in_rx),
        pending: pending.clone(),
        closed: CancellationToken::new(),
    });
    let handle = SessionHandle {
        inbound: in_tx,
        pending,
    };
    state
        .streamable_sessions
        .register(session_id.clone(), handle.clone())
        .await;

    let cancel = state.shutdown.child_token();
    let guard = server.session_guard();
    let sessions = state.streamable_sessions.clone();
    let task_session_id = session_id.clone();
    tokio::spawn(async move {
        match Bridge::connect(child.clone(), transport, cancel).await {
            Ok(bridge) => {
                if let Err(e) = bridge.run().await {
                    warn!(session_id = %task_session_id, error = %e, "Bridge terminated with error");
                }
            }
            Err(e) => {
                warn!(session_id = %task_session_id, error = %e, "Failed to establish bridge");
            }
        }
        sessions.unregister(&task_session_id).await;
        drop(guard);
    });

    Ok((session_id, handle))
}

/// Feed one message into a session; requests block until their response.
async fn exchange(
    handle: &SessionHandle,
    session_id: Option<&str>,
    message: McpMessage,
) -> Response {
    let waiter = match &message {
        McpMessage::Request(request) => match handle.pending.register(request.id.clone()) {
            Some(rx) => Some(rx),
            None => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(serde_json::json!({ "error": "Session closed" })),
                )
                    .into_response();
            }
        },
        _ => None,
    };

    if handle.inbound.send(message).await.is_err() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Session closed" })),
        )
            .into_response();
    }

    match waiter {
        Some(rx) => match rx.await {
            Ok(response) => json_response(response, session_id),
            Err(_) => (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": "Session closed before response" })),
            )
                .into_response(),
        },
        None => accepted(session_id),
    }
}

/// One whole bridge per POST: spawn, handshake, forward, tear down.
async fn stateless_exchange(
    state: &AppState,
    server: &Arc<crate::registry::RegisteredServer>,
    headers: &HeaderMap,
    message: McpMessage,
) -> Response {
    let child = match spawn_child(server, headers) {
        Ok(child) => Arc::new(child),
        Err(e) => {
            warn!(server = %server.entry.name, error = %e, "Failed to spawn child");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let guard = server.session_guard();
    let cancel = state.shutdown.child_token();
    let upstream: Arc<dyn Transport> = child.clone();

    let response = tokio::select! {
        _ = cancel.cancelled() => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "Shutting down" })),
        )
            .into_response()),
        result = stateless_dispatch(upstream.clone(), message) => result,
    };

    upstream.close().await;
    drop(guard);

    match response {
        Ok(Some(response)) => json_response(response, None),
        Ok(None) => accepted(None),
        Err(response) => response.into_response(),
    }
}

async fn stateless_dispatch(
    upstream: Arc<dyn Transport>,
    message: McpMessage,
) -> Result<Option<JsonRpcResponse>, Response> {
    let mut session = SessionEndpoint::initiate(upstream, proxy_client_info())
        .await
        .map_err(|e| {
            warn!(error = %e, "Upstream handshake failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        })?;

    match message {
        // The proxy answers the handshake itself, mirroring the upstream.
        McpMessage::Request(request) if request.method == METHOD_INITIALIZE => {
            let result = mirror_advertisement(session.peer()).to_initialize_result();
            let value = serde_json::to_value(result).unwrap_or_default();
            Ok(Some(JsonRpcResponse::result(request.id, value)))
        }
        McpMessage::Notification(n) if n.method == METHOD_INITIALIZED => Ok(None),
        McpMessage::Request(request) => {
            let id = request.id.clone();
            session
                .send(McpMessage::Request(request))
                .await
                .map_err(gateway_error)?;
            loop {
                match session.recv().await {
                    Ok(Some(McpMessage::Response(response))) if response.id == id => {
                        return Ok(Some(response));
                    }
                    Ok(Some(other)) => {
                        debug!(
                            method = other.method().unwrap_or("-"),
                            "Dropping message while waiting for response"
                        );
                    }
                    Ok(None) => {
                        return Err((
                            StatusCode::BAD_GATEWAY,
                            Json(serde_json::json!({ "error": "Server closed before responding" })),
                        )
                            .into_response());
                    }
                    Err(e) if e.is_per_message() => {
                        warn!(error = %e, "Dropping malformed message");
                    }
                    Err(e) => return Err(gateway_error(e)),
                }
            }
        }
        other => {
            session.send(other).await.map_err(gateway_error)?;
            Ok(None)
        }
    }
}

fn gateway_error(e: BridgeError) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}

fn json_response(response: JsonRpcResponse, session_id: Option<&str>) -> Response {
    let value = serde_json::to_value(&response).unwrap_or(serde_json::Value::Null);
    let mut http = Json(value).into_response();
    attach_session(&mut http, session_id);
    http
}

fn accepted(session_id: Option<&str>) -> Response {
    let mut http = (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "ok" })),
    )
        .into_response();
    attach_session(&mut http, session_id);
    http
}

fn attach_session(response: &mut Response, session_id: Option<&str>) {
    if let Some(id) = session_id {
        if let Ok(value) = id.parse() {
            response.headers_mut().insert(SESSION_ID_HEADER, value);
        }
    }
}
