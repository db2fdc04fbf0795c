//! Model Context Protocol (MCP) session engine
//!
//! Key components:
//! - JSON-RPC 2.0 envelopes and MCP payloads
//! - Event-stream parsing and three transport bindings (event stream, direct HTTP, stdio)
//! - Handshake and protocol version negotiation
//! - Request/response correlation under concurrency
//! - Conversation context store fed by server notifications
//! - Tool-call validation and hidden-content screening

pub mod client;
pub mod context;
pub mod errors;
pub mod handshake;
pub mod notifications;
pub mod pending;
pub mod protocol;
pub mod sse;
pub mod tools;
pub mod transport;

pub use client::{ClientStats, McpClient, McpClientConfig};
pub use context::{Context, ContextStore, ContextUpdate, MemoryBlock};
pub use errors::{ErrorCategory, ErrorSeverity, MCPError, MCPResult};
pub use handshake::{Handshake, HandshakeConfig, HandshakeState, NegotiatedSession, Session};
pub use notifications::NotificationRouter;
pub use pending::PendingRequests;
pub use protocol::{
    ClientCapabilities, Implementation, JsonRpcError, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ProtocolVersion, ServerCapabilities,
};
pub use sse::{SseEvent, SseParser};
pub use tools::{
    ExecutionStatus, HiddenContentPolicy, ToolCall, ToolDescription, ToolRegistry, ToolResult,
    ValidationOutcome,
};
pub use transport::{
    ConnectionStatus, HttpTransport, NotificationHandler, SseTransport, StdioTransport,
    Transport, TransportConfig, TransportFactory, TransportStats, TransportType,
};
