//! MCP Transport Layer
//!
//! One interface, three bindings:
//! - [`SseTransport`]: streaming GET for inbound traffic, POST per outbound call
//! - [`HttpTransport`]: direct synchronous POST with the reply inline
//! - [`StdioTransport`]: line-delimited JSON over a child process or any pipe
//!
//! Shared plumbing lives here: configuration, statistics, the HTTP
//! submission client and the router that demultiplexes inbound envelopes.

pub mod http;
pub mod sse;
pub mod stdio;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::{
    errors::{MCPError, MCPResult},
    handshake::{HandshakeChannel, HandshakeConfig, Session},
    pending::PendingRequests,
    protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

/// Header identifying the caller on every submission (`X-Client-ID`)
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Transport type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Event stream plus synchronous submissions
    Sse,
    /// Direct synchronous HTTP
    Http,
    /// Standard I/O transport
    Stdio,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Sse => "sse",
            TransportType::Http => "http",
            TransportType::Stdio => "stdio",
        }
    }
}

/// Connection status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Not connected
    Disconnected,
    /// Handshake or stream setup in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Connection failed
    Failed(String),
    /// Connection closed
    Closed,
}

/// Transport statistics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TransportStats {
    /// Total messages sent
    pub messages_sent: u64,
    /// Total messages received
    pub messages_received: u64,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Connection attempts
    pub connection_attempts: u64,
    /// Successful connections
    pub successful_connections: u64,
    /// Failed connections
    pub failed_connections: u64,
    /// Event-stream re-opens after termination
    pub stream_reopens: u64,
    /// Inbound messages that could not be handled
    pub dropped_messages: u64,
    /// Last activity timestamp
    pub last_activity: Option<DateTime<Utc>>,
    /// Connection uptime
    pub uptime: Duration,
    /// Connection start time
    #[serde(skip)]
    pub connection_start: Option<Instant>,
}

impl TransportStats {
    /// Update statistics for sent message
    pub fn update_sent(&mut self, message_size: usize) {
        self.messages_sent += 1;
        self.bytes_sent += message_size as u64;
        self.last_activity = Some(Utc::now());
    }

    /// Update statistics for received message
    pub fn update_received(&mut self, message_size: usize) {
        self.messages_received += 1;
        self.bytes_received += message_size as u64;
        self.last_activity = Some(Utc::now());
    }

    /// Update connection statistics
    pub fn update_connection(&mut self, success: bool) {
        self.connection_attempts += 1;
        if success {
            self.successful_connections += 1;
            self.connection_start = Some(Instant::now());
        } else {
            self.failed_connections += 1;
        }
    }

    pub fn update_dropped(&mut self) {
        self.dropped_messages += 1;
    }

    /// Update uptime
    pub fn update_uptime(&mut self) {
        if let Some(start) = self.connection_start {
            self.uptime = start.elapsed();
        }
    }

    /// Get success rate
    pub fn success_rate(&self) -> f64 {
        if self.connection_attempts == 0 {
            0.0
        } else {
            self.successful_connections as f64 / self.connection_attempts as f64
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport type
    pub transport_type: TransportType,
    /// Stream URL, direct endpoint URL, or command line for stdio
    pub endpoint: String,
    /// Address the handshake is posted to; defaults to `endpoint`
    pub init_endpoint: Option<String>,
    /// Value of the `X-Client-ID` header and the session identity
    pub client_id: String,
    /// Bound on each synchronous call
    pub request_timeout: Duration,
    /// Bound on waiting for the initial endpoint event
    pub endpoint_timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Reconnection attempts when opening the stream
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnection attempts
    pub reconnect_delay: Duration,
    /// Times a terminated stream is re-opened before the session fails
    pub max_stream_reopens: u32,
    /// Maximum message size
    pub max_message_size: usize,
    /// Additional headers sent with every submission
    pub headers: HashMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport_type: TransportType::Sse,
            endpoint: "http://localhost:8080/sse".to_string(),
            init_endpoint: None,
            client_id: Uuid::new_v4().to_string(),
            request_timeout: Duration::from_secs(30),
            endpoint_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(2),
            max_stream_reopens: 0,
            max_message_size: 4 * 1024 * 1024, // 4MB
            headers: HashMap::new(),
        }
    }
}

impl TransportConfig {
    /// Parsed endpoint URL (HTTP bindings)
    pub fn endpoint_url(&self) -> MCPResult<Url> {
        Ok(Url::parse(&self.endpoint)?)
    }

    /// Parsed handshake URL, relative references resolved against `endpoint`
    pub fn init_url(&self) -> MCPResult<Url> {
        let base = self.endpoint_url()?;
        match &self.init_endpoint {
            Some(init) => Ok(base.join(init)?),
            None => Ok(base),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> MCPResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(MCPError::configuration("Endpoint cannot be empty"));
        }
        if self.client_id.trim().is_empty() {
            return Err(MCPError::configuration("Client id cannot be empty"));
        }
        if self.request_timeout.is_zero() || self.endpoint_timeout.is_zero() {
            return Err(MCPError::configuration("Timeouts must be greater than zero"));
        }
        if self.max_message_size == 0 {
            return Err(MCPError::configuration("Maximum message size must be greater than zero"));
        }
        if self.transport_type != TransportType::Stdio {
            let url = self.init_url()?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(MCPError::configuration(format!(
                    "Unsupported URL scheme '{}'",
                    url.scheme()
                )));
            }
        }
        Ok(())
    }
}

/// Handler for inbound notifications
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Handle one notification; an error aborts processing of that message only
    async fn handle_notification(&self, notification: JsonRpcNotification) -> MCPResult<()>;
}

/// Session transport interface
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run the handshake and bring the session up
    async fn start(&self, cancel: &CancellationToken) -> MCPResult<Session>;

    /// Fire-and-forget notification
    async fn send(&self, notification: JsonRpcNotification) -> MCPResult<()>;

    /// Issue a request and wait for its response
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> MCPResult<JsonRpcResponse>;

    /// Install the handler that receives inbound notifications
    fn set_notification_handler(&self, handler: Arc<dyn NotificationHandler>);

    /// Close the session; idempotent
    async fn close(&self) -> MCPResult<()>;

    /// Get connection status
    fn status(&self) -> ConnectionStatus;

    /// Snapshot of the session state
    fn session(&self) -> Session;

    /// Get transport statistics
    fn stats(&self) -> TransportStats;
}

/// Reply to a synchronous submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReply {
    pub status: u16,
    pub body: String,
}

impl SubmitReply {
    /// Require a "no content" acknowledgment
    pub fn expect_no_content(self) -> MCPResult<()> {
        if self.status == 204 {
            Ok(())
        } else {
            Err(MCPError::http_status(self.status, self.body))
        }
    }

    /// Decode the body as the JSON-RPC response to `id`
    pub fn into_response(self, id: i64) -> MCPResult<JsonRpcResponse> {
        if !matches!(self.status, 200 | 202) {
            return Err(MCPError::http_status(self.status, self.body));
        }
        if self.body.trim().is_empty() {
            return Err(MCPError::invalid_message(format!(
                "Empty reply to request {}",
                id
            )));
        }
        match JsonRpcMessage::from_json(&self.body)? {
            JsonRpcMessage::Response(response) if response.id == Some(id) => Ok(response),
            JsonRpcMessage::Response(response) => Err(MCPError::invalid_message(format!(
                "Reply id {:?} does not match request {}",
                response.id, id
            ))),
            _ => Err(MCPError::invalid_message("Reply is not a JSON-RPC response")),
        }
    }
}

/// HTTP client for synchronous submissions
#[derive(Debug, Clone)]
pub struct HttpSubmitter {
    client: reqwest::Client,
    request_timeout: Duration,
}

fn default_headers(config: &TransportConfig) -> MCPResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in &config.headers {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
            MCPError::configuration(format!("Invalid header key '{}': {}", key, e))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            MCPError::configuration(format!("Invalid header value '{}': {}", value, e))
        })?;
        headers.insert(name, value);
    }
    let client_id = HeaderValue::from_str(&config.client_id)
        .map_err(|e| MCPError::configuration(format!("Invalid client id: {}", e)))?;
    headers.insert(HeaderName::from_static(CLIENT_ID_HEADER), client_id);
    Ok(headers)
}

impl HttpSubmitter {
    /// Build the submission client
    pub fn new(config: &TransportConfig) -> MCPResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("mcp-session/", env!("CARGO_PKG_VERSION")))
            .default_headers(default_headers(config)?)
            .build()
            .map_err(|e| MCPError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            request_timeout: config.request_timeout,
        })
    }

    /// Build a client for long-lived streams: same headers, no overall timeout
    pub fn stream_client(config: &TransportConfig) -> MCPResult<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("mcp-session/", env!("CARGO_PKG_VERSION")))
            .default_headers(default_headers(config)?)
            .build()
            .map_err(|e| MCPError::configuration(format!("Failed to create HTTP client: {}", e)))
    }

    /// POST a JSON body to `url`
    pub async fn post(&self, url: &Url, body: String) -> MCPResult<SubmitReply> {
        debug!("POST {} ({} bytes)", url, body.len());
        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.map_error(e))?;
        Ok(SubmitReply { status, body })
    }

    fn map_error(&self, err: reqwest::Error) -> MCPError {
        if err.is_timeout() {
            MCPError::timeout(self.request_timeout.as_millis() as u64)
        } else {
            err.into()
        }
    }
}

/// Handshake channel posting to a fixed address
pub struct HttpHandshakeChannel<'a> {
    pub submitter: &'a HttpSubmitter,
    pub url: &'a Url,
    pub stats: &'a Mutex<TransportStats>,
}

#[async_trait]
impl HandshakeChannel for HttpHandshakeChannel<'_> {
    async fn initialize(&self, request: JsonRpcRequest) -> MCPResult<JsonRpcResponse> {
        let id = request.id;
        let body = serde_json::to_string(&request)?;
        self.stats.lock().update_sent(body.len());
        let reply = self.submitter.post(self.url, body).await?;
        reply.into_response(id)
    }

    async fn initialized(&self, notification: JsonRpcNotification) -> MCPResult<()> {
        let body = serde_json::to_string(&notification)?;
        self.stats.lock().update_sent(body.len());
        self.submitter.post(self.url, body).await?.expect_no_content()
    }
}

/// Demultiplexes inbound envelopes: responses to their waiters,
/// notifications to the installed handler
pub struct MessageRouter {
    pending: Arc<PendingRequests>,
    handler: RwLock<Option<Arc<dyn NotificationHandler>>>,
    stats: Mutex<TransportStats>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(PendingRequests::new()),
            handler: RwLock::new(None),
            stats: Mutex::new(TransportStats::default()),
        }
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    pub fn stats(&self) -> &Mutex<TransportStats> {
        &self.stats
    }

    pub fn set_handler(&self, handler: Arc<dyn NotificationHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Route one raw inbound message
    pub async fn dispatch(&self, raw: &str) -> MCPResult<()> {
        self.stats.lock().update_received(raw.len());

        let message = match JsonRpcMessage::from_json(raw) {
            Ok(message) => message,
            Err(e) => {
                self.stats.lock().update_dropped();
                return Err(e);
            }
        };
        self.route(message).await
    }

    /// Route one decoded inbound message
    pub async fn route(&self, message: JsonRpcMessage) -> MCPResult<()> {
        match message {
            JsonRpcMessage::Response(response) => {
                if !self.pending.resolve(response) {
                    self.stats.lock().update_dropped();
                }
                Ok(())
            }
            JsonRpcMessage::Notification(notification) => self.notify(notification).await,
            JsonRpcMessage::Request(request) => {
                warn!(
                    "Ignoring server-initiated request {} ({})",
                    request.id, request.method
                );
                self.stats.lock().update_dropped();
                Ok(())
            }
        }
    }

    /// Hand a notification to the installed handler
    pub async fn notify(&self, notification: JsonRpcNotification) -> MCPResult<()> {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler.handle_notification(notification).await,
            None => {
                debug!("No handler installed; dropping {}", notification.method);
                self.stats.lock().update_dropped();
                Ok(())
            }
        }
    }
}

/// Transport factory for creating different transport types
pub struct TransportFactory;

impl TransportFactory {
    /// Create a transport based on configuration
    pub fn create(
        config: TransportConfig,
        handshake: HandshakeConfig,
    ) -> MCPResult<Arc<dyn Transport>> {
        config.validate()?;
        match config.transport_type {
            TransportType::Sse => Ok(Arc::new(SseTransport::new(config, handshake)?)),
            TransportType::Http => Ok(Arc::new(HttpTransport::new(config, handshake)?)),
            TransportType::Stdio => Ok(Arc::new(StdioTransport::new(config, handshake)?)),
        }
    }

    /// Create an event-stream transport for `url`
    pub fn create_sse(url: impl Into<String>) -> MCPResult<Arc<dyn Transport>> {
        let config = TransportConfig {
            transport_type: TransportType::Sse,
            endpoint: url.into(),
            ..Default::default()
        };
        Self::create(config, HandshakeConfig::default())
    }

    /// Create a direct HTTP transport for `url`
    pub fn create_http(url: impl Into<String>) -> MCPResult<Arc<dyn Transport>> {
        let config = TransportConfig {
            transport_type: TransportType::Http,
            endpoint: url.into(),
            ..Default::default()
        };
        Self::create(config, HandshakeConfig::default())
    }

    /// Create a stdio transport running `command`
    pub fn create_stdio(command: impl Into<String>) -> MCPResult<Arc<dyn Transport>> {
        let config = TransportConfig {
            transport_type: TransportType::Stdio,
            endpoint: command.into(),
            ..Default::default()
        };
        Self::create(config, HandshakeConfig::default())
    }
}
