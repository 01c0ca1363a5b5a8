//! SSE client transport for remote MCP servers.
//!
//! Server-to-client messages arrive on a long-lived `text/event-stream` GET;
//! client-to-server messages are POSTed to the companion endpoint announced
//! by the first `endpoint` event.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::{OAuthClientCredentials, OutboundAuth};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::McpMessage;
use crate::transport::{SseParser, Transport};

/// TLS verification policy for outbound HTTP.
#[derive(Debug, Clone, Default)]
pub enum VerifySsl {
    /// System trust roots.
    #[default]
    Enabled,
    /// No certificate verification.
    Disabled,
    /// Trust a specific CA bundle.
    CaBundle(PathBuf),
}

pub(crate) fn build_http_client(verify: &VerifySsl) -> BridgeResult<reqwest::Client> {
    let builder = reqwest::Client::builder().connect_timeout(std::time::Duration::from_secs(30));
    let builder = match verify {
        VerifySsl::Enabled => builder,
        VerifySsl::Disabled => builder.danger_accept_invalid_certs(true),
        VerifySsl::CaBundle(path) => {
            let pem = std::fs::read(path).map_err(|e| {
                BridgeError::ConfigInvalid(format!("cannot read CA bundle {}: {e}", path.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                BridgeError::ConfigInvalid(format!("invalid CA bundle {}: {e}", path.display()))
            })?;
            builder.add_root_certificate(cert)
        }
    };
    builder
        .build()
        .map_err(|e| BridgeError::ConnectionFailed(format!("failed to build HTTP client: {e}")))
}

/// SSE transport configuration.
#[derive(Debug, Clone)]
pub struct SseClientConfig {
    /// SSE URL of the remote server (e.g. `https://host/sse`).
    pub url: String,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    pub verify_ssl: VerifySsl,
    pub oauth: Option<OAuthClientCredentials>,
    /// `API_ACCESS_TOKEN` fallback bearer.
    pub api_access_token: Option<String>,
}

impl SseClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            verify_ssl: VerifySsl::default(),
            oauth: None,
            api_access_token: None,
        }
    }
}

/// SSE transport (client role).
pub struct SseClientTransport {
    client: reqwest::Client,
    auth: Arc<OutboundAuth>,
    endpoint: watch::Receiver<Option<String>>,
    inbound: Mutex<mpsc::Receiver<BridgeResult<McpMessage>>>,
    closed: CancellationToken,
}

impl SseClientTransport {
    /// Open the SSE stream and start the reader.
    pub async fn connect(config: SseClientConfig) -> BridgeResult<Self> {
        let auth = Arc::new(OutboundAuth::new(
            &config.headers,
            config.oauth.clone(),
            config.api_access_token.clone(),
        )?);
        let client = build_http_client(&config.verify_ssl)?;

        let response = open_stream(&client, &auth, &config.url).await?;

        let base = url::Url::parse(&config.url)
            .map_err(|e| BridgeError::ConfigInvalid(format!("invalid SSE URL: {e}")))?;
        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        let (tx, rx) = mpsc::channel(1);
        let closed = CancellationToken::new();

        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    _ = reader_closed.cancelled() => return,
                    chunk = stream.next() => chunk,
                };
                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                    None => {
                        debug!("SSE stream ended");
                        return;
                    }
                };
                for event in parser.push(&chunk) {
                    match event.event.as_str() {
                        "endpoint" => {
                            let resolved = match base.join(&event.data) {
                                Ok(url) => url.to_string(),
                                Err(e) => {
                                    warn!(error = %e, data = %event.data, "Unusable endpoint event");
                                    continue;
                                }
                            };
                            debug!(endpoint = %resolved, "SSE endpoint discovered");
                            let _ = endpoint_tx.send(Some(resolved));
                        }
                        "message" => {
                            if tx.send(McpMessage::from_json(&event.data)).await.is_err() {
                                return;
                            }
                        }
                        other => {
                            debug!(event = %other, "Ignoring SSE event");
                        }
                    }
                }
            }
        });

        Ok(Self {
            client,
            auth,
            endpoint: endpoint_rx,
            inbound: Mutex::new(rx),
            closed,
        })
    }

    async fn endpoint_url(&self) -> BridgeResult<String> {
        let mut endpoint = self.endpoint.clone();
        let guard = endpoint
            .wait_for(|url| url.is_some())
            .await
            .map_err(|_| BridgeError::TransportClosed)?;
        Ok((*guard).clone().expect("endpoint present"))
    }
}

/// GET the SSE URL, refreshing the OAuth token once on 401.
async fn open_stream(
    client: &reqwest::Client,
    auth: &OutboundAuth,
    url: &str,
) -> BridgeResult<reqwest::Response> {
    for attempt in 0..2 {
        let headers = auth.headers(client).await?;
        let response = client
            .get(url)
            .headers(headers)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| BridgeError::ConnectionFailed(format!("SSE connect failed: {e}")))?;

        match response.status() {
            status if status.is_success() => return Ok(response),
            StatusCode::UNAUTHORIZED if attempt == 0 && auth.can_refresh() => {
                debug!("SSE endpoint returned 401, refreshing token");
                auth.refresh(client).await?;
            }
            StatusCode::UNAUTHORIZED => {
                return Err(BridgeError::AuthFailure(
                    "SSE endpoint rejected credentials".to_string(),
                ));
            }
            status => {
                return Err(BridgeError::ConnectionFailed(format!(
                    "SSE endpoint returned {status}"
                )));
            }
        }
    }
    unreachable!("auth retry loop always returns")
}

#[async_trait::async_trait]
impl Transport for SseClientTransport {
    async fn send(&self, message: McpMessage) -> BridgeResult<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::TransportClosed);
        }
        let endpoint = self.endpoint_url().await?;

        for attempt in 0..2 {
            let headers = self.auth.headers(&self.client).await?;
            let response = self
                .client
                .post(&endpoint)
                .headers(headers)
                .json(&message.to_value())
                .send()
                .await
                .map_err(BridgeError::from)?;

            match response.status() {
                status if status.is_success() => return Ok(()),
                StatusCode::UNAUTHORIZED if attempt == 0 && self.auth.can_refresh() => {
                    debug!("Message POST returned 401, refreshing token");
                    self.auth.refresh(&self.client).await?;
                }
                StatusCode::UNAUTHORIZED => {
                    return Err(BridgeError::AuthFailure(
                        "message endpoint rejected credentials".to_string(),
                    ));
                }
                status => {
                    return Err(BridgeError::ConnectionFailed(format!(
                        "message endpoint returned {status}"
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SseClientConfig::new("https://example.com/sse");
        assert!(config.headers.is_empty());
        assert!(config.oauth.is_none());
        assert!(matches!(config.verify_ssl, VerifySsl::Enabled));
    }

    #[test]
    fn test_build_client_with_missing_ca_bundle_fails() {
        let result = build_http_client(&VerifySsl::CaBundle(PathBuf::from(
            "/nonexistent/ca-bundle.pem",
        )));
        assert!(matches!(result, Err(BridgeError::ConfigInvalid(_))));
    }

    #[test]
    fn test_build_client_insecure() {
        assert!(build_http_client(&VerifySsl::Disabled).is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let config = SseClientConfig::new("http://127.0.0.1:1/sse");
        let result = SseClientTransport::connect(config).await;
        assert!(matches!(result, Err(BridgeError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_connect_invalid_url() {
        let config = SseClientConfig::new("not a url");
        let result = SseClientTransport::connect(config).await;
        assert!(result.is_err());
    }
}
