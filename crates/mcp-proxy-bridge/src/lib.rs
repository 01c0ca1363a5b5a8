//! Session-bridging engine for the Model Context Protocol.
//!
//! For every logical peering the bridge establishes two transport
//! endpoints, opens an MCP session on each, and relays every message from
//! one onto the other while preserving correlation, ordering and lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   session    ┌────────────┐   session    ┌────────────┐
//! │  MCP peer  │◀────────────▶│   Bridge   │◀────────────▶│  MCP peer  │
//! │ (ingress)  │  endpoint A  │ (2 pumps)  │  endpoint B  │ (upstream) │
//! └────────────┘              └────────────┘              └────────────┘
//! ```
//!
//! Two surfaces reuse the engine:
//!
//! - **stdio → remote**: the proxy speaks stdio to a parent MCP client and
//!   forwards to a remote server over SSE or Streamable HTTP.
//! - **HTTP server → stdio children**: the proxy listens on a port and
//!   spawns one named child per ingress session, with selected request
//!   headers injected into the child environment.

pub mod auth;
pub mod bridge;
pub mod error;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use auth::OAuthClientCredentials;
pub use bridge::{proxy_client_info, Bridge, DRAIN_DEADLINE};
pub use error::{BridgeError, BridgeResult};
pub use http::{create_router, AppState};
pub use protocol::{ClientInfo, McpMessage, MessageId, PROTOCOL_VERSION};
pub use registry::{NamedServerEntry, ServerRegistry, SpawnDescriptor};
pub use session::{SessionEndpoint, HANDSHAKE_QUEUE_LIMIT, HANDSHAKE_TIMEOUT};
pub use transport::{
    SseClientConfig, SseClientTransport, StdioServerTransport, StdioTransport,
    StreamableClientConfig, StreamableHttpTransport, Transport, VerifySsl,
};
