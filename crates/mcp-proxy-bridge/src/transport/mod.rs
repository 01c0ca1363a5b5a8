//! Transport implementations.
//!
//! A transport is a full-duplex, message-oriented pipe with exactly one
//! sender and one receiver per direction. Three carriers share the contract:
//! stdio child processes, SSE, and Streamable HTTP.

mod sse;
mod stdio;
mod streamable;

pub use sse::{SseClientConfig, SseClientTransport, VerifySsl};
pub use stdio::{StdioServerTransport, StdioTransport};
pub use streamable::{StreamableClientConfig, StreamableHttpTransport};

use async_trait::async_trait;

use crate::error::BridgeResult;
use crate::protocol::McpMessage;

/// Bidirectional message stream over some carrier.
///
/// `recv` returning `Ok(None)` is end-of-stream: the peer is gone and no
/// further `send` will succeed. `close` is idempotent and unblocks a pending
/// `recv`. A malformed wire frame surfaces as `Err(MalformedMessage)`
/// without closing the stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message to the peer.
    async fn send(&self, message: McpMessage) -> BridgeResult<()>;

    /// Receive the next message, or `None` at end-of-stream.
    async fn recv(&self) -> BridgeResult<Option<McpMessage>>;

    /// Close both directions.
    async fn close(&self);
}

/// One parsed Server-Sent Events frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental SSE frame parser.
///
/// Feed raw body chunks; complete events come back out. Comment lines and
/// fields other than `event`/`data` are skipped. The default event type is
/// `message`.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(SseEvent {
                        event: self
                            .event
                            .take()
                            .unwrap_or_else(|| "message".to_string()),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                } else {
                    self.event = None;
                }
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event = Some(value.strip_prefix(' ').unwrap_or(value).to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // id:, retry: and comment lines are irrelevant here
        }
        events
    }
}

#[cfg(test)]
pub(crate) mod channel {
    //! In-memory transport pair for tests.

    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Mutex};
    use tokio_util::sync::CancellationToken;

    use super::Transport;
    use crate::error::{BridgeError, BridgeResult};
    use crate::protocol::McpMessage;

    /// One end of a connected in-memory transport pair.
    pub(crate) struct ChannelTransport {
        tx: StdMutex<Option<mpsc::UnboundedSender<McpMessage>>>,
        rx: Mutex<mpsc::UnboundedReceiver<McpMessage>>,
        closed: CancellationToken,
    }

    impl ChannelTransport {
        pub fn pair() -> (Arc<Self>, Arc<Self>) {
            let (a_tx, b_rx) = mpsc::unbounded_channel();
            let (b_tx, a_rx) = mpsc::unbounded_channel();
            let a = Arc::new(Self {
                tx: StdMutex::new(Some(a_tx)),
                rx: Mutex::new(a_rx),
                closed: CancellationToken::new(),
            });
            let b = Arc::new(Self {
                tx: StdMutex::new(Some(b_tx)),
                rx: Mutex::new(b_rx),
                closed: CancellationToken::new(),
            });
            (a, b)
        }
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&self, message: McpMessage) -> BridgeResult<()> {
            if self.closed.is_cancelled() {
                return Err(BridgeError::TransportClosed);
            }
            let guard = self.tx.lock().expect("sender lock poisoned");
            match guard.as_ref() {
                Some(tx) => tx.send(message).map_err(|_| BridgeError::TransportClosed),
                None => Err(BridgeError::TransportClosed),
            }
        }

        async fn recv(&self) -> BridgeResult<Option<McpMessage>> {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                _ = self.closed.cancelled() => Ok(None),
                next = rx.recv() => Ok(next),
            }
        }

        async fn close(&self) {
            self.closed.cancel();
            self.tx.lock().expect("sender lock poisoned").take();
        }
    }
}
