//! Streamable HTTP client transport.
//!
//! A single endpoint carries everything: each outbound message is a POST
//! whose response body is either one JSON envelope or a chunked SSE stream
//! of `message` events. In stateful mode the server-assigned
//! `Mcp-Session-Id` is echoed on every subsequent request.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sse::build_http_client;
use crate::auth::{OAuthClientCredentials, OutboundAuth};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::McpMessage;
use crate::transport::{SseParser, Transport, VerifySsl};

/// Session id header defined by the Streamable HTTP transport.
pub(crate) const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Streamable HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct StreamableClientConfig {
    /// The MCP endpoint URL (e.g. `https://host/mcp`).
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub verify_ssl: VerifySsl,
    pub oauth: Option<OAuthClientCredentials>,
    pub api_access_token: Option<String>,
    /// When set, no session identifier is retained across requests.
    pub stateless: bool,
}

impl StreamableClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            verify_ssl: VerifySsl::default(),
            oauth: None,
            api_access_token: None,
            stateless: false,
        }
    }
}

/// Streamable HTTP transport (client role).
pub struct StreamableHttpTransport {
    client: reqwest::Client,
    auth: Arc<OutboundAuth>,
    url: String,
    stateless: bool,
    session_id: StdMutex<Option<String>>,
    inbound_tx: mpsc::Sender<BridgeResult<McpMessage>>,
    inbound: Mutex<mpsc::Receiver<BridgeResult<McpMessage>>>,
    closed: CancellationToken,
}

impl StreamableHttpTransport {
    /// Build the transport. No request is made until the first `send`.
    pub fn new(config: StreamableClientConfig) -> BridgeResult<Self> {
        let auth = Arc::new(OutboundAuth::new(
            &config.headers,
            config.oauth.clone(),
            config.api_access_token.clone(),
        )?);
        let client = build_http_client(&config.verify_ssl)?;
        let (tx, rx) = mpsc::channel(1);

        Ok(Self {
            client,
            auth,
            url: config.url,
            stateless: config.stateless,
            session_id: StdMutex::new(None),
            inbound_tx: tx,
            inbound: Mutex::new(rx),
            closed: CancellationToken::new(),
        })
    }

    fn current_session(&self) -> Option<String> {
        self.session_id.lock().expect("session lock poisoned").clone()
    }

    /// Remember the server-assigned session id, unless running stateless.
    fn remember_session(&self, headers: &HeaderMap) {
        if self.stateless {
            return;
        }
        if let Some(id) = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) {
            let mut guard = self.session_id.lock().expect("session lock poisoned");
            if guard.as_deref() != Some(id) {
                debug!(session_id = %id, "Streamable HTTP session established");
                *guard = Some(id.to_string());
            }
        }
    }

    async fn dispatch_response(&self, response: reqwest::Response) -> BridgeResult<()> {
        self.remember_session(response.headers());

        let status = response.status();
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            // Stream the body in the background so send() stays one
            // suspension point; each `message` event is one inbound frame.
            let tx = self.inbound_tx.clone();
            let closed = self.closed.clone();
            tokio::spawn(async move {
                let mut parser = SseParser::new();
                let mut stream = response.bytes_stream();
                loop {
                    let chunk = tokio::select! {
                        _ = closed.cancelled() => return,
                        chunk = stream.next() => chunk,
                    };
                    match chunk {
                        Some(Ok(chunk)) => {
                            for event in parser.push(&chunk) {
                                if event.event == "message"
                                    && tx.send(McpMessage::from_json(&event.data)).await.is_err()
                                {
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Streamable HTTP response stream failed");
                            return;
                        }
                        None => return,
                    }
                }
            });
            return Ok(());
        }

        let body = response.text().await.map_err(BridgeError::from)?;
        if body.trim().is_empty() {
            return Ok(());
        }
        let _ = self.inbound_tx.send(McpMessage::from_json(&body)).await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&self, message: McpMessage) -> BridgeResult<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::TransportClosed);
        }

        for attempt in 0..2 {
            let mut headers = self.auth.headers(&self.client).await?;
            headers.insert(
                ACCEPT,
                reqwest::header::HeaderValue::from_static("application/json, text/event-stream"),
            );
            if let Some(session) = self.current_session() {
                if let Ok(value) = session.parse() {
                    headers.insert(SESSION_ID_HEADER, value);
                }
            }

            let response = self
                .client
                .post(&self.url)
                .headers(headers)
                .json(&message.to_value())
                .send()
                .await
                .map_err(BridgeError::from)?;

            match response.status() {
                status if status.is_success() => return self.dispatch_response(response).await,
                StatusCode::UNAUTHORIZED if attempt == 0 && self.auth.can_refresh() => {
                    debug!("Streamable HTTP POST returned 401, refreshing token");
                    self.auth.refresh(&self.client).await?;
                }
                StatusCode::UNAUTHORIZED => {
                    return Err(BridgeError::AuthFailure(
                        "endpoint rejected credentials".to_string(),
                    ));
                }
                status => {
                    return Err(BridgeError::ConnectionFailed(format!(
                        "endpoint returned {status}"
                    )));
                }
            }
        }
        unreachable!("auth retry loop always returns")
    }

    async fn recv(&self) -> BridgeResult<Option<McpMessage>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            next = inbound.recv() => next.transpose(),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
