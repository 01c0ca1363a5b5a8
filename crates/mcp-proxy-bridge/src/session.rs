//! MCP session endpoints.
//!
//! A session endpoint wraps a transport with handshake state. The proxy
//! plays one of two roles per endpoint: initiator (we act as the MCP client
//! toward the peer) or responder (we act as the MCP server). No payload
//! traffic is released until the handshake completes; early arrivals are
//! held in order and drained first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{
    ClientInfo, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, McpMessage, MessageId, ServerInfo, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_PING, PROTOCOL_VERSION,
};
use crate::transport::Transport;

/// Deadline for the whole handshake, both roles.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum messages held while the handshake is still in flight.
pub const HANDSHAKE_QUEUE_LIMIT: usize = 64;

/// What the counterpart declared during the handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub name: String,
    pub version: Option<String>,
    /// Raw capability set; unknown capabilities are carried verbatim.
    pub capabilities: Value,
    pub protocol_version: String,
}

/// What a responder-side endpoint advertises to its peer.
#[derive(Debug, Clone)]
pub struct ServerAdvertisement {
    pub protocol_version: String,
    pub capabilities: Value,
    pub server_info: ServerInfo,
}

impl ServerAdvertisement {
    pub(crate) fn to_initialize_result(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: self.protocol_version.clone(),
            capabilities: self.capabilities.clone(),
            server_info: self.server_info.clone(),
            extra: Map::new(),
        }
    }
}

/// A transport that has completed the MCP handshake.
pub struct SessionEndpoint {
    transport: Arc<dyn Transport>,
    peer: PeerInfo,
    queue: VecDeque<McpMessage>,
}

impl SessionEndpoint {
    /// Initiator role: send `initialize`, await the result, confirm with
    /// `notifications/initialized`.
    pub async fn initiate(
        transport: Arc<dyn Transport>,
        client_info: ClientInfo,
    ) -> BridgeResult<Self> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, run_initiate(transport, client_info))
            .await
            .map_err(|_| BridgeError::HandshakeTimeout)?
    }

    /// Responder role: await `initialize`, answer with `advertisement`,
    /// await `notifications/initialized`.
    pub async fn respond(
        transport: Arc<dyn Transport>,
        advertisement: ServerAdvertisement,
    ) -> BridgeResult<Self> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, run_respond(transport, advertisement))
            .await
            .map_err(|_| BridgeError::HandshakeTimeout)?
    }

    /// The counterpart's declared identity and capabilities.
    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Handle to the underlying transport, for sends and closing.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Next message: handshake-era holdovers first, then live traffic.
    pub async fn recv(&mut self) -> BridgeResult<Option<McpMessage>> {
        if let Some(held) = self.queue.pop_front() {
            return Ok(Some(held));
        }
        self.transport.recv().await
    }

    pub async fn send(&self, message: McpMessage) -> BridgeResult<()> {
        self.transport.send(message).await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

/// Hold a pre-ready message, closing the session when the bound is hit.
///
/// Pings are exempt: the protocol allows them at any time, so they are
/// answered on the spot instead of queued.
async fn hold(
    queue: &mut VecDeque<McpMessage>,
    message: McpMessage,
    transport: &Arc<dyn Transport>,
) -> BridgeResult<()> {
    if let McpMessage::Request(request) = &message {
        if request.method == METHOD_PING {
            return transport
                .send(McpMessage::Response(JsonRpcResponse::result(
                    request.id.clone(),
                    Value::Object(Map::new()),
                )))
                .await;
        }
    }
    if queue.len() >= HANDSHAKE_QUEUE_LIMIT {
        warn!("Handshake queue overflow, closing session");
        transport.close().await;
        return Err(BridgeError::HandshakeOverflow);
    }
    queue.push_back(message);
    Ok(())
}

async fn run_initiate(
    transport: Arc<dyn Transport>,
    client_info: ClientInfo,
) -> BridgeResult<SessionEndpoint> {
    // Ids of relayed traffic belong to the peers; a prefixed uuid keeps the
    // proxy's own handshake id out of their space.
    let init_id = MessageId::String(format!("mcp-proxy-{}", uuid::Uuid::new_v4()));
    let params = InitializeParams {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: Value::Object(Map::new()),
        client_info,
        extra: Map::new(),
    };
    transport
        .send(McpMessage::Request(JsonRpcRequest::new(
            init_id.clone(),
            METHOD_INITIALIZE,
            Some(serde_json::to_value(&params)?),
        )))
        .await?;

    let mut queue = VecDeque::new();
    let result = loop {
        match transport.recv().await {
            Ok(Some(McpMessage::Response(response))) if response.id == init_id => {
                if let Some(error) = response.error {
                    return Err(BridgeError::HandshakeFailed(error.message));
                }
                let result = response.result.ok_or_else(|| {
                    BridgeError::HandshakeFailed("initialize response missing result".to_string())
                })?;
                break serde_json::from_value::<InitializeResult>(result)
                    .map_err(|e| BridgeError::HandshakeFailed(e.to_string()))?;
            }
            Ok(Some(other)) => hold(&mut queue, other, &transport).await?,
            Ok(None) => return Err(BridgeError::TransportClosed),
            Err(e) if e.is_per_message() => {
                warn!(error = %e, "Dropping malformed message during handshake");
            }
            Err(e) => return Err(e),
        }
    };

    transport
        .send(McpMessage::Notification(JsonRpcNotification::new(
            METHOD_INITIALIZED,
            None,
        )))
        .await?;

    debug!(
        server = %result.server_info.name,
        protocol_version = %result.protocol_version,
        "Upstream session ready"
    );

    Ok(SessionEndpoint {
        transport,
        peer: PeerInfo {
            name: result.server_info.name,
            version: result.server_info.version,
            capabilities: result.capabilities,
            protocol_version: result.protocol_version,
        },
        queue,
    })
}

async fn run_respond(
    transport: Arc<dyn Transport>,
    advertisement: ServerAdvertisement,
) -> BridgeResult<SessionEndpoint> {
    let mut queue = VecDeque::new();

    let (init_id, params) = loop {
        match transport.recv().await {
            Ok(Some(McpMessage::Request(request))) if request.method == METHOD_INITIALIZE => {
                let params = request
                    .params
                    .ok_or_else(|| {
                        BridgeError::HandshakeFailed("initialize request missing params".to_string())
                    })
                    .and_then(|p| {
                        serde_json::from_value::<InitializeParams>(p)
                            .map_err(|e| BridgeError::HandshakeFailed(e.to_string()))
                    })?;
                break (request.id, params);
            }
            Ok(Some(other)) => hold(&mut queue, other, &transport).await?,
            Ok(None) => return Err(BridgeError::TransportClosed),
            Err(e) if e.is_per_message() => {
                warn!(error = %e, "Dropping malformed message during handshake");
            }
            Err(e) => return Err(e),
        }
    };

    transport
        .send(McpMessage::Response(JsonRpcResponse::result(
            init_id,
            serde_json::to_value(advertisement.to_initialize_result())?,
        )))
        .await?;

    loop {
        match transport.recv().await {
            Ok(Some(McpMessage::Notification(n))) if n.method == METHOD_INITIALIZED => break,
            Ok(Some(other)) => hold(&mut queue, other, &transport).await?,
            Ok(None) => return Err(BridgeError::TransportClosed),
            Err(e) if e.is_per_message() => {
                warn!(error = %e, "Dropping malformed message during handshake");
            }
            Err(e) => return Err(e),
        }
    }

    debug!(client = %params.client_info.name, "Downstream session ready");

    Ok(SessionEndpoint {
        transport,
        peer: PeerInfo {
            name: params.client_info.name,
            version: params.client_info.version,
            capabilities: params.capabilities,
            protocol_version: params.protocol_version,
        },
        queue,
    })
}
