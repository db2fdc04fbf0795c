//! Direct HTTP transport binding
//!
//! Every request is a synchronous `POST` whose body carries the response.
//! There is no inbound channel, so server notifications never arrive here.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::{
    ConnectionStatus, HttpHandshakeChannel, HttpSubmitter, MessageRouter, NotificationHandler,
    Transport, TransportConfig, TransportStats,
};
use crate::mcp::{
    errors::{MCPError, MCPResult},
    handshake::{Handshake, HandshakeConfig, Session},
    protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

/// HTTP transport implementation
pub struct HttpTransport {
    /// Transport configuration
    config: TransportConfig,
    handshake_config: HandshakeConfig,
    endpoint: Url,
    init_url: Url,
    submitter: HttpSubmitter,
    /// Id allocation and statistics; nothing is ever routed inbound
    router: MessageRouter,
    session: RwLock<Session>,
    status: RwLock<ConnectionStatus>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(config: TransportConfig, handshake_config: HandshakeConfig) -> MCPResult<Self> {
        let endpoint = config.endpoint_url()?;
        let init_url = config.init_url()?;
        let submitter = HttpSubmitter::new(&config)?;
        let session = Session::new(&config.client_id, handshake_config.capabilities.clone());

        Ok(Self {
            config,
            handshake_config,
            endpoint,
            init_url,
            submitter,
            router: MessageRouter::new(),
            session: RwLock::new(session),
            status: RwLock::new(ConnectionStatus::Disconnected),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_ready(&self) -> MCPResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MCPError::Closed);
        }
        if !self.session.read().initialized {
            return Err(MCPError::NotInitialized);
        }
        Ok(())
    }

    fn encode(&self, body: String) -> MCPResult<String> {
        if body.len() > self.config.max_message_size {
            return Err(MCPError::validation(format!(
                "Message too large: {} bytes",
                body.len()
            )));
        }
        self.router.stats().lock().update_sent(body.len());
        Ok(body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(&self, cancel: &CancellationToken) -> MCPResult<Session> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MCPError::Closed);
        }
        if self.session.read().initialized {
            return Err(MCPError::invalid_state("transport already started"));
        }

        info!("Connecting to HTTP endpoint: {}", self.endpoint);
        *self.status.write() = ConnectionStatus::Connecting;

        let channel = HttpHandshakeChannel {
            submitter: &self.submitter,
            url: &self.init_url,
            stats: self.router.stats(),
        };
        let mut handshake = Handshake::new(self.handshake_config.clone());
        let id = self.router.pending().next_id();

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(MCPError::Cancelled),
            _ = self.shutdown.cancelled() => Err(MCPError::Closed),
            result = handshake.perform(&channel, id) => result,
        };

        match result {
            Ok(negotiated) => {
                self.router.stats().lock().update_connection(true);
                let mut session = self.session.write();
                session.record(&negotiated);
                session.endpoint = Some(self.endpoint.to_string());
                *self.status.write() = ConnectionStatus::Connected;
                info!(
                    "HTTP session ready (protocol {})",
                    negotiated.protocol_version
                );
                Ok(session.clone())
            }
            Err(err) => {
                self.router.stats().lock().update_connection(false);
                if !self.closed.load(Ordering::SeqCst) {
                    *self.status.write() = ConnectionStatus::Failed(err.to_string());
                }
                Err(err)
            }
        }
    }

    async fn send(&self, notification: JsonRpcNotification) -> MCPResult<()> {
        self.ensure_ready()?;
        let body = self.encode(serde_json::to_string(&notification)?)?;

        debug!("Sending notification {}", notification.method);
        self.submitter
            .post(&self.endpoint, body)
            .await?
            .expect_no_content()
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> MCPResult<JsonRpcResponse> {
        self.ensure_ready()?;

        let id = self.router.pending().next_id();
        let request = JsonRpcRequest::new(id, method, params);
        let body = self.encode(serde_json::to_string(&request)?)?;
        debug!("Sending request {} ({})", id, method);

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MCPError::Cancelled),
            _ = self.shutdown.cancelled() => return Err(MCPError::Closed),
            reply = self.submitter.post(&self.endpoint, body) => reply?,
        };

        self.router.stats().lock().update_received(reply.body.len());
        reply.into_response(id)
    }

    fn set_notification_handler(&self, _handler: Arc<dyn NotificationHandler>) {
        debug!("HTTP transport has no inbound channel; notification handler unused");
    }

    async fn close(&self) -> MCPResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        *self.status.write() = ConnectionStatus::Closed;
        info!("HTTP transport closed");
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.status.read().clone()
    }

    fn session(&self) -> Session {
        self.session.read().clone()
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.router.stats().lock().clone();
        stats.update_uptime();
        stats
    }
}
