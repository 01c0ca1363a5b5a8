//! HTTP server front-end.
//!
//! Exposes the SSE and Streamable HTTP surfaces and routes each ingress
//! session to a named server entry:
//!
//! ```text
//! GET  /sse                        SSE stream, default server
//! POST /messages/                  companion POST, default server
//! POST /mcp                        Streamable HTTP, default server
//! GET  /servers/{name}/sse         SSE stream, named server
//! POST /servers/{name}/messages/   companion POST, named server
//! POST /servers/{name}/mcp         Streamable HTTP, named server
//! GET  /status                     liveness report
//! ```
//!
//! Every ingress session spawns its own child process; children are never
//! pooled, because the header-derived environment may differ per request.

pub mod sse;
pub mod status;
pub mod streamable;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::ORIGIN;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::error::BridgeResult;
use crate::registry::{RegisteredServer, ServerRegistry};
use crate::transport::StdioTransport;

/// Shared state of the front-end.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ServerRegistry>,
    pub(crate) sse_sessions: Arc<sse::SseSessions>,
    pub(crate) streamable_sessions: Arc<streamable::StreamableSessions>,
    /// Streamable HTTP runs one bridge (and one child) per POST.
    pub stateless: bool,
    /// Allowed `Origin` values; empty denies all cross-origin requests.
    pub allow_origin: Arc<Vec<String>>,
    /// Global shutdown token; every bridge runs on a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        registry: Arc<ServerRegistry>,
        stateless: bool,
        allow_origin: Vec<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            sse_sessions: Arc::new(sse::SseSessions::default()),
            streamable_sessions: Arc::new(streamable::StreamableSessions::default()),
            stateless,
            allow_origin: Arc::new(allow_origin),
            shutdown,
        }
    }
}

/// Assemble the full router.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.allow_origin);

    Router::new()
        .route("/sse", get(sse::default_sse))
        .route("/messages/", post(sse::default_message))
        .route("/mcp", post(streamable::default_mcp))
        .route("/mcp/", post(streamable::default_mcp))
        .route("/servers/{name}/sse", get(sse::named_sse))
        .route("/servers/{name}/messages/", post(sse::named_message))
        .route("/servers/{name}/mcp", post(streamable::named_mcp))
        .route("/servers/{name}/mcp/", post(streamable::named_mcp))
        .route("/status", get(status::handle_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_origin,
        ))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let list: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(list)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Reject disallowed cross-origin requests before anything is spawned.
/// Requests without an `Origin` header are same-origin and always pass.
async fn enforce_origin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(origin) = request.headers().get(ORIGIN).and_then(|v| v.to_str().ok()) {
        let allowed = state
            .allow_origin
            .iter()
            .any(|o| o == "*" || o.eq_ignore_ascii_case(origin));
        if !allowed {
            warn!(origin = %origin, "Rejecting cross-origin request");
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    next.run(request).await
}

/// Look up an entry, or answer 404 for unknown and disabled names.
pub(crate) fn resolve_server(
    state: &AppState,
    name: Option<&str>,
) -> Result<Arc<RegisteredServer>, Response> {
    state.registry.resolve(name).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({ "error": "Unknown server" })),
        )
            .into_response()
    })
}

/// Spawn the per-session child with header-derived environment injected.
pub(crate) fn spawn_child(
    server: &Arc<RegisteredServer>,
    headers: &HeaderMap,
) -> BridgeResult<StdioTransport> {
    let header_env = server.entry.header_env(headers);
    if !header_env.is_empty() {
        tracing::debug!(
            server = %server.entry.name,
            vars = header_env.len(),
            "Injecting header-derived environment"
        );
    }
    let descriptor = server.entry.spawn_descriptor(header_env);
    StdioTransport::spawn(&descriptor, server.entry.name.clone())
}
