//! The session-bridging engine.
//!
//! A bridge couples two session endpoints: the *upstream* (the real MCP
//! server we initiated toward) and the *downstream* (the peer we present
//! that server to). The handshake is mirrored rather than relayed: the
//! downstream sees the upstream's capabilities under the proxy's name.
//! After that, two forwarders pump messages in both directions until either
//! side goes away.

use std::sync::Arc;

use serde_json::Map;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{ClientInfo, ServerInfo};
use crate::session::{PeerInfo, ServerAdvertisement, SessionEndpoint};
use crate::transport::Transport;

/// How long the surviving forwarder gets to drain after the first close.
pub const DRAIN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(2);

/// Identity the proxy presents when initiating toward an upstream server.
pub fn proxy_client_info() -> ClientInfo {
    ClientInfo::new("mcp-proxy", env!("CARGO_PKG_VERSION"))
}

/// Advertisement shown downstream: the upstream's capabilities, verbatim
/// (unknown capabilities included), under the proxy's name with the
/// upstream's version.
pub(crate) fn mirror_advertisement(upstream: &PeerInfo) -> ServerAdvertisement {
    ServerAdvertisement {
        protocol_version: upstream.protocol_version.clone(),
        capabilities: upstream.capabilities.clone(),
        server_info: ServerInfo {
            name: "mcp-proxy".to_string(),
            version: upstream.version.clone(),
            extra: Map::new(),
        },
    }
}

/// Two coupled session endpoints plus the token that tears them down.
pub struct Bridge {
    upstream: SessionEndpoint,
    downstream: SessionEndpoint,
    cancel: CancellationToken,
}

impl Bridge {
    /// Establish both sessions: initiate on `upstream` first, then answer
    /// the `downstream` handshake with the mirrored advertisement.
    ///
    /// On failure both transports are closed before the error is returned.
    pub async fn connect(
        upstream: Arc<dyn Transport>,
        downstream: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> BridgeResult<Self> {
        let up = match SessionEndpoint::initiate(upstream.clone(), proxy_client_info()).await {
            Ok(up) => up,
            Err(e) => {
                tokio::join!(upstream.close(), downstream.close());
                return Err(e);
            }
        };

        let advertisement = mirror_advertisement(up.peer());
        let down = match SessionEndpoint::respond(downstream.clone(), advertisement).await {
            Ok(down) => down,
            Err(e) => {
                tokio::join!(upstream.close(), downstream.close());
                return Err(e);
            }
        };

        debug!(
            upstream = %up.peer().name,
            downstream = %down.peer().name,
            "Bridge established"
        );

        Ok(Self {
            upstream: up,
            downstream: down,
            cancel,
        })
    }

    pub fn upstream_peer(&self) -> &PeerInfo {
        self.upstream.peer()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Relay until either side ends, then close both and drain the survivor
    /// within [`DRAIN_DEADLINE`].
    pub async fn run(self) -> BridgeResult<()> {
        let up_transport = self.upstream.transport();
        let down_transport = self.downstream.transport();

        let mut up_to_down: JoinHandle<BridgeResult<()>> = tokio::spawn(forward(
            self.upstream,
            down_transport.clone(),
            self.cancel.clone(),
            "upstream->downstream",
        ));
        let mut down_to_up: JoinHandle<BridgeResult<()>> = tokio::spawn(forward(
            self.downstream,
            up_transport.clone(),
            self.cancel.clone(),
            "downstream->upstream",
        ));

        let upstream_finished_first;
        let first = tokio::select! {
            r = &mut up_to_down => {
                upstream_finished_first = true;
                join_result(r)
            }
            r = &mut down_to_up => {
                upstream_finished_first = false;
                join_result(r)
            }
        };

        // Either side vanishing takes the whole bridge down.
        self.cancel.cancel();
        tokio::join!(up_transport.close(), down_transport.close());

        let survivor = if upstream_finished_first {
            &mut down_to_up
        } else {
            &mut up_to_down
        };
        let second = match tokio::time::timeout(DRAIN_DEADLINE, &mut *survivor).await {
            Ok(r) => join_result(r),
            Err(_) => {
                warn!("Forwarder did not drain within deadline, aborting");
                survivor.abort();
                Ok(())
            }
        };

        first.and(second)
    }
}

fn join_result(result: Result<BridgeResult<()>, tokio::task::JoinError>) -> BridgeResult<()> {
    match result {
        Ok(r) => r,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(BridgeError::Io(std::io::Error::other(e))),
    }
}

/// Pump one direction. FIFO, one message in flight, ids untouched.
async fn forward(
    mut source: SessionEndpoint,
    sink: Arc<dyn Transport>,
    cancel: CancellationToken,
    direction: &'static str,
) -> BridgeResult<()> {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = source.recv() => next,
        };
        match next {
            Ok(Some(message)) => {
                trace!(
                    direction,
                    method = message.method().unwrap_or("-"),
                    "Relaying message"
                );
                match sink.send(message).await {
                    Ok(()) => {}
                    Err(e) if e.is_clean_close() => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
            Ok(None) => {
                debug!(direction, "End of stream");
                return Ok(());
            }
            Err(e) if e.is_per_message() => {
                warn!(direction, error = %e, "Dropping malformed message");
            }
            Err(e) if e.is_clean_close() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpMessage, MessageId,
        METHOD_INITIALIZE, METHOD_INITIALIZED,
    };
    use crate::transport::channel::ChannelTransport;
    use serde_json::json;

    /// Handshake the given transport as a real MCP server would.
    async fn serve_handshake(peer: &ChannelTransport) {
        let init = peer.recv().await.unwrap().unwrap();
        let id = init.id().unwrap().clone();
        peer.send(McpMessage::Response(JsonRpcResponse::result(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "real-server", "version": "1.2.3"}
            }),
        )))
        .await
        .unwrap();
        let confirmed = peer.recv().await.unwrap().unwrap();
        assert_eq!(confirmed.method(), Some(METHOD_INITIALIZED));
    }

    /// Handshake the given transport as a real MCP client would, returning
    /// the initialize result payload.
    async fn client_handshake(peer: &ChannelTransport) -> serde_json::Value {
        peer.send(McpMessage::Request(JsonRpcRequest::new(
            MessageId::Number(0),
            METHOD_INITIALIZE,
            Some(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "client", "version": "0.1.0"}
            })),
        )))
        .await
        .unwrap();
        let reply = peer.recv().await.unwrap().unwrap();
        let result = match reply {
            McpMessage::Response(r) => r.result.unwrap(),
            other => panic!("expected initialize response, got {other:?}"),
        };
        peer.send(McpMessage::Notification(JsonRpcNotification::new(
            METHOD_INITIALIZED,
            None,
        )))
        .await
        .unwrap();
        result
    }

    async fn connected_bridge() -> (Bridge, Arc<ChannelTransport>, Arc<ChannelTransport>) {
        let (up_ours, up_theirs) = ChannelTransport::pair();
        let (down_ours, down_theirs) = ChannelTransport::pair();

        let server = tokio::spawn(async move {
            serve_handshake(&up_theirs).await;
            up_theirs
        });
        let client = tokio::spawn(async move {
            let result = client_handshake(&down_theirs).await;
            (down_theirs, result)
        });

        let bridge = Bridge::connect(up_ours, down_ours, CancellationToken::new())
            .await
            .unwrap();
        let server_end = server.await.unwrap();
        let (client_end, init_result) = client.await.unwrap();

        assert_eq!(init_result["serverInfo"]["name"], "mcp-proxy");
        assert_eq!(init_result["serverInfo"]["version"], "1.2.3");
        assert_eq!(init_result["capabilities"]["tools"]["listChanged"], json!(true));

        (bridge, server_end, client_end)
    }

    #[tokio::test]
    async fn test_handshake_mirroring() {
        let (bridge, _server, _client) = connected_bridge().await;
        assert_eq!(bridge.upstream_peer().name, "real-server");
    }

    #[tokio::test]
    async fn test_relay_preserves_order_and_ids() {
        let (bridge, server, client) = connected_bridge().await;
        let running = tokio::spawn(bridge.run());

        for id in 1..=5 {
            client
                .send(McpMessage::Request(JsonRpcRequest::new(
                    MessageId::Number(id),
                    "tools/call",
                    Some(json!({"seq": id})),
                )))
                .await
                .unwrap();
        }
        for id in 1..=5 {
            let relayed = server.recv().await.unwrap().unwrap();
            assert_eq!(relayed.id(), Some(&MessageId::Number(id)));
            match &relayed {
                McpMessage::Request(r) => {
                    assert_eq!(r.params.as_ref().unwrap()["seq"], json!(id));
                }
                other => panic!("expected request, got {other:?}"),
            }
            // Answer out of nothing: the response id must come back unchanged.
            server
                .send(McpMessage::Response(JsonRpcResponse::result(
                    MessageId::Number(id),
                    json!({"ok": id}),
                )))
                .await
                .unwrap();
        }
        for id in 1..=5 {
            let response = client.recv().await.unwrap().unwrap();
            assert_eq!(response.id(), Some(&MessageId::Number(id)));
        }

        client.close().await;
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_notifications_flow_both_ways() {
        let (bridge, server, client) = connected_bridge().await;
        let running = tokio::spawn(bridge.run());

        server
            .send(McpMessage::Notification(JsonRpcNotification::new(
                "notifications/progress",
                Some(json!({"progress": 50})),
            )))
            .await
            .unwrap();
        let relayed = client.recv().await.unwrap().unwrap();
        assert_eq!(relayed.method(), Some("notifications/progress"));

        client
            .send(McpMessage::Notification(JsonRpcNotification::new(
                "notifications/cancelled",
                None,
            )))
            .await
            .unwrap();
        let relayed = server.recv().await.unwrap().unwrap();
        assert_eq!(relayed.method(), Some("notifications/cancelled"));

        server.close().await;
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closing_one_side_closes_the_other() {
        let (bridge, server, client) = connected_bridge().await;
        let running = tokio::spawn(bridge.run());

        server.close().await;

        // The client observes its own transport close.
        assert!(client.recv().await.unwrap().is_none());
        running.await.unwrap().unwrap();
        assert!(client
            .send(McpMessage::Notification(JsonRpcNotification::new(
                "notifications/late",
                None,
            )))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancellation_token_tears_bridge_down() {
        let (bridge, server, client) = connected_bridge().await;
        let cancel = bridge.cancellation_token();
        let running = tokio::spawn(bridge.run());

        cancel.cancel();
        running.await.unwrap().unwrap();
        assert!(server.recv().await.unwrap().is_none());
        assert!(client.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_closes_both_transports() {
        let (up_ours, up_theirs) = ChannelTransport::pair();
        let (down_ours, down_theirs) = ChannelTransport::pair();

        // Upstream rejects initialization outright.
        tokio::spawn(async move {
            let init = up_theirs.recv().await.unwrap().unwrap();
            let id = init.id().unwrap().clone();
            up_theirs
                .send(McpMessage::Response(JsonRpcResponse::error(
                    id,
                    -32603,
                    "broken",
                )))
                .await
                .unwrap();
        });

        let result = Bridge::connect(up_ours, down_ours, CancellationToken::new()).await;
        assert!(matches!(result, Err(BridgeError::HandshakeFailed(_))));
        assert!(down_theirs.recv().await.unwrap().is_none());
    }
}
