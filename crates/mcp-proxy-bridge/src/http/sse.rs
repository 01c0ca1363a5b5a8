//! SSE ingress.
//!
//! Each `GET .../sse` spawns one child, bridges it to the HTTP client, and
//! streams server-to-client traffic as SSE `message` events. The first
//! event is always `endpoint`: the URL the client must POST its own
//! messages to, carrying the session id.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{resolve_server, spawn_child, AppState};
use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::McpMessage;
use crate::transport::Transport;

/// Live SSE sessions: session id to the channel feeding that session's
/// downstream transport.
#[derive(Default)]
pub(crate) struct SseSessions {
    sessions: RwLock<HashMap<String, mpsc::Sender<McpMessage>>>,
}

impl SseSessions {
    async fn register(&self, session_id: String, tx: mpsc::Sender<McpMessage>) {
        self.sessions.write().await.insert(session_id.clone(), tx);
        info!(session_id = %session_id, "SSE session registered");
    }

    async fn unregister(&self, session_id: &str) {
        if self.sessions.write().await.remove(session_id).is_some() {
            info!(session_id = %session_id, "SSE session unregistered");
        }
    }

    /// Deliver one POSTed message to a session. Errors when the session is
    /// gone.
    async fn feed(&self, session_id: &str, message: McpMessage) -> Result<(), ()> {
        let tx = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        };
        match tx {
            Some(tx) => tx.send(message).await.map_err(|_| ()),
            None => Err(()),
        }
    }
}

/// Downstream transport backed by the SSE response stream and its
/// companion POST endpoint.
struct SseServerTransport {
    outbound: mpsc::Sender<McpMessage>,
    inbound: Mutex<mpsc::Receiver<McpMessage>>,
    closed: CancellationToken,
}

#[async_trait]
impl Transport for SseServerTransport {
    async fn send(&self, message: McpMessage) -> BridgeResult<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::TransportClosed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| BridgeError::TransportClosed)
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
    }
}

/// Cancels the bridge when the HTTP client goes away.
struct DisconnectGuard {
    cancel: CancellationToken,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) async fn default_sse(State(state): State<AppState>, headers: HeaderMap) -> Response {
    serve_sse(state, None, headers).await
}

pub(crate) async fn named_sse(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve_sse(state, Some(name), headers).await
}

async fn serve_sse(state: AppState, name: Option<String>, headers: HeaderMap) -> Response {
    let server = match resolve_server(&state, name.as_deref()) {
        Ok(server) => server,
        Err(response) => return response,
    };

    let child = match spawn_child(&server, &headers) {
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

    let session_id = uuid::Uuid::new_v4().to_string();
    let endpoint_url = match &name {
        Some(name) => format!("/servers/{name}/messages/?session_id={session_id}"),
        None => format!("/messages/?session_id={session_id}"),
    };

    let (out_tx, mut out_rx) = mpsc::channel(1);
    let (in_tx, in_rx) = mpsc::channel(1);
    state.sse_sessions.register(session_id.clone(), in_tx).await;

    let transport: Arc<dyn Transport> = Arc::new(SseServerTransport {
        outbound: out_tx,
        inbound: Mutex::new(in_rx),
        closed: CancellationToken::new(),
    });

    let cancel = state.shutdown.child_token();
    let guard = server.session_guard();
    let sessions = state.sse_sessions.clone();
    let bridge_cancel = cancel.clone();
    let task_child = child.clone();
    let task_session_id = session_id.clone();
    tokio::spawn(async move {
        let bridge = tokio::select! {
            _ = bridge_cancel.cancelled() => {
                tokio::join!(task_child.close(), transport.close());
                None
            }
            result = Bridge::connect(
                task_child.clone(),
                transport.clone(),
                bridge_cancel.clone(),
            ) => match result {
                Ok(bridge) => Some(bridge),
                Err(e) => {
                    warn!(session_id = %task_session_id, error = %e, "Failed to establish bridge");
                    None
                }
            }
        };
        if let Some(bridge) = bridge {
            if let Err(e) = bridge.run().await {
                warn!(session_id = %task_session_id, error = %e, "Bridge terminated with error");
            }
        }
        if let Some(code) = task_child.exit_code() {
            if code != 0 {
                warn!(session_id = %task_session_id, exit_code = code, "Child exited with failure");
            }
        }
        sessions.unregister(&task_session_id).await;
        drop(guard);
    });

    info!(session_id = %session_id, endpoint = %endpoint_url, "SSE session established");

    let stream = async_stream::stream! {
        let _disconnect = DisconnectGuard { cancel };
        yield Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint_url));
        while let Some(message) = out_rx.recv().await {
            yield Ok(Event::default().event("message").data(message.to_json()));
        }
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("ping"),
        )
        .into_response()
}

#[derive(Deserialize)]
pub(crate) struct MessageQuery {
    session_id: String,
}

pub(crate) async fn default_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Response {
    handle_message(state, query, body).await
}

pub(crate) async fn named_message(
    State(state): State<AppState>,
    Path(_name): Path<String>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Response {
    handle_message(state, query, body).await
}

async fn handle_message(state: AppState, query: MessageQuery, body: String) -> Response {
    let message = match McpMessage::from_json(&body) {
        Ok(message) => message,
        Err(e) => {
            warn!(session_id = %query.session_id, error = %e, "Rejecting malformed message");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    if state
        .sse_sessions
        .feed(&query.session_id, message)
        .await
        .is_err()
    {
        warn!(session_id = %query.session_id, "Message for unknown session");
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Session not found" })),
        )
            .into_response();
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "ok" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::create_router;
    use crate::registry::{NamedServerEntry, ServerRegistry};
    use axum::body::Body;
    use tower::ServiceExt;

    fn router() -> axum::Router {
        let registry = Arc::new(
            ServerRegistry::new(None, vec![NamedServerEntry::new("echo", "/bin/cat")]).unwrap(),
        );
        create_router(AppState::new(
            registry,
            false,
            Vec::new(),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_message_for_unknown_session_is_404() {
        let response = router()
            .oneshot(
                axum::http::Request::post("/servers/echo/messages/?session_id=nope")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_message_is_400() {
        let response = router()
            .oneshot(
                axum::http::Request::post("/servers/echo/messages/?session_id=x")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sessions_feed_and_unregister() {
        let sessions = SseSessions::default();
        let (tx, mut rx) = mpsc::channel(1);
        sessions.register("s1".to_string(), tx).await;

        let message = McpMessage::from_json(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        sessions.feed("s1", message).await.unwrap();
        assert!(rx.recv().await.is_some());

        sessions.unregister("s1").await;
        let message = McpMessage::from_json(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#).unwrap();
        assert!(sessions.feed("s1", message).await.is_err());
    }

    #[tokio::test]
    async fn test_sse_server_transport_close_unblocks() {
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (_in_tx, in_rx) = mpsc::channel(1);
        let transport = Arc::new(SseServerTransport {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            closed: CancellationToken::new(),
        });

        let t2 = transport.clone();
        let pending = tokio::spawn(async move { t2.recv().await });
        tokio::task::yield_now().await;
        transport.close().await;
        assert!(matches!(pending.await.unwrap(), Ok(None)));
    }
}
