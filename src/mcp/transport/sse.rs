//! Event-stream transport binding
//!
//! Inbound traffic arrives on a long-lived `GET` with
//! `Accept: text/event-stream`; outbound calls are individual `POST`s to the
//! address announced by the server's `endpoint` event.
//!
//! Start-up sequence:
//! 1. handshake over the initialization address
//! 2. open the stream, retrying connect failures with a fixed delay
//! 3. wait for the first `endpoint` event (bounded by `endpoint_timeout`)
//!
//! An `endpoint` event whose origin differs from the stream's origin fails
//! the session closed.

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    ConnectionStatus, HttpHandshakeChannel, HttpSubmitter, MessageRouter, NotificationHandler,
    Transport, TransportConfig, TransportStats,
};
use crate::mcp::{
    errors::{MCPError, MCPResult},
    handshake::{Handshake, HandshakeConfig, Session},
    protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
    sse::{event_stream, SseEvent},
};

/// Event carrying the submission address
pub const ENDPOINT_EVENT: &str = "endpoint";
/// Event carrying a JSON-RPC envelope
pub const MESSAGE_EVENT: &str = "message";

/// Discovery state of the submission address
#[derive(Debug, Clone, PartialEq)]
enum EndpointState {
    Pending,
    Ready(Url),
    Failed(MCPError),
}

/// How one stream consumption ended
enum StreamEnd {
    /// Session shut down locally
    Shutdown,
    /// Peer closed the stream
    Ended,
    /// Read error
    Failed(MCPError),
    /// Security-critical failure; the session must not continue
    Fatal(MCPError),
}

struct SseInner {
    config: TransportConfig,
    handshake_config: HandshakeConfig,
    stream_url: Url,
    init_url: Url,
    submitter: HttpSubmitter,
    stream_client: reqwest::Client,
    router: MessageRouter,
    session: RwLock<Session>,
    status: RwLock<ConnectionStatus>,
    endpoint: watch::Sender<EndpointState>,
    shutdown: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

/// Event-stream transport
pub struct SseTransport {
    inner: Arc<SseInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Create a new event-stream transport
    pub fn new(config: TransportConfig, handshake_config: HandshakeConfig) -> MCPResult<Self> {
        let stream_url = config.endpoint_url()?;
        let init_url = config.init_url()?;
        let submitter = HttpSubmitter::new(&config)?;
        let stream_client = HttpSubmitter::stream_client(&config)?;
        let session = Session::new(&config.client_id, handshake_config.capabilities.clone());
        let (endpoint, _) = watch::channel(EndpointState::Pending);

        Ok(Self {
            inner: Arc::new(SseInner {
                config,
                handshake_config,
                stream_url,
                init_url,
                submitter,
                stream_client,
                router: MessageRouter::new(),
                session: RwLock::new(session),
                status: RwLock::new(ConnectionStatus::Disconnected),
                endpoint,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            reader: Mutex::new(None),
        })
    }

    /// Current submission address, once discovered
    pub fn endpoint(&self) -> Option<Url> {
        match &*self.inner.endpoint.borrow() {
            EndpointState::Ready(url) => Some(url.clone()),
            _ => None,
        }
    }

    /// Process one decoded stream event as the reader task would
    #[cfg(test)]
    async fn dispatch_event(&self, event: SseEvent) -> MCPResult<()> {
        let result = self.inner.dispatch_event(event).await;
        if let Err(e @ MCPError::EndpointMismatch { .. }) = &result {
            self.inner.fail_session(e.clone());
        }
        result
    }

    /// Mark the handshake as done without running it
    #[cfg(test)]
    fn assume_initialized(&self, negotiated: &crate::mcp::handshake::NegotiatedSession) {
        self.inner.session.write().record(negotiated);
        self.inner.started.store(true, Ordering::SeqCst);
        *self.inner.status.write() = ConnectionStatus::Connected;
    }

    async fn start_inner(&self, cancel: &CancellationToken) -> MCPResult<Session> {
        let inner = &self.inner;

        let negotiated = {
            let channel = HttpHandshakeChannel {
                submitter: &inner.submitter,
                url: &inner.init_url,
                stats: inner.router.stats(),
            };
            let mut handshake = Handshake::new(inner.handshake_config.clone());
            let id = inner.router.pending().next_id();
            tokio::select! {
                _ = cancel.cancelled() => return Err(MCPError::Cancelled),
                _ = inner.shutdown.cancelled() => return Err(MCPError::Closed),
                result = handshake.perform(&channel, id) => result?,
            }
        };
        inner.session.write().record(&negotiated);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(MCPError::Cancelled),
            _ = inner.shutdown.cancelled() => return Err(MCPError::Closed),
            result = inner.open_stream() => result?,
        };

        let reader_inner = inner.clone();
        *self.reader.lock() = Some(tokio::spawn(async move {
            reader_inner.run_reader(response).await;
        }));

        let endpoint = inner.wait_for_endpoint(cancel).await?;
        info!("Event-stream session ready, submitting to {}", endpoint);

        *inner.status.write() = ConnectionStatus::Connected;
        Ok(inner.session.read().clone())
    }
}

impl SseInner {
    /// Open the event stream, retrying connect failures with a fixed delay
    async fn open_stream(&self) -> MCPResult<reqwest::Response> {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut attempt = 0;

        loop {
            debug!("Opening event stream {} (attempt {})", self.stream_url, attempt + 1);
            let result = self
                .stream_client
                .get(self.stream_url.clone())
                .header(ACCEPT, "text/event-stream")
                .send()
                .await;

            match result {
                Ok(response) if response.status().as_u16() == 200 => {
                    self.router.stats().lock().update_connection(true);
                    return Ok(response);
                }
                Ok(response) => {
                    self.router.stats().lock().update_connection(false);
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Err(MCPError::http_status(status, body));
                }
                Err(e) => {
                    self.router.stats().lock().update_connection(false);
                    let err = MCPError::from(e);
                    if attempt >= max_attempts {
                        return Err(MCPError::connection(format!(
                            "failed to open event stream after {} attempt(s): {}",
                            attempt + 1,
                            err
                        )));
                    }
                    attempt += 1;
                    warn!(
                        "Event stream connect failed ({}); retrying in {:?}",
                        err, self.config.reconnect_delay
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(MCPError::Closed),
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                    }
                }
            }
        }
    }

    /// Consume streams until shutdown, re-opening a terminated stream at most
    /// `max_stream_reopens` times
    async fn run_reader(self: Arc<Self>, mut response: reqwest::Response) {
        let mut reopens = 0;

        loop {
            let cause = match self.consume(response).await {
                StreamEnd::Shutdown => return,
                StreamEnd::Fatal(err) => {
                    self.fail_session(err);
                    return;
                }
                StreamEnd::Ended => {
                    info!("Event stream closed by server");
                    MCPError::connection("event stream closed by server")
                }
                StreamEnd::Failed(err) => {
                    error!("Event stream read failed: {}", err);
                    err
                }
            };

            if reopens >= self.config.max_stream_reopens {
                self.fail_session(cause);
                return;
            }
            reopens += 1;
            self.router.stats().lock().stream_reopens += 1;
            info!(
                "Re-opening event stream ({}/{})",
                reopens, self.config.max_stream_reopens
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
            response = match self.open_stream().await {
                Ok(response) => response,
                Err(MCPError::Closed) => return,
                Err(err) => {
                    self.fail_session(err);
                    return;
                }
            };
        }
    }

    async fn consume(&self, response: reqwest::Response) -> StreamEnd {
        let mut events = Box::pin(event_stream(response.bytes_stream()));

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return StreamEnd::Shutdown,
                next = events.next() => next,
            };

            match next {
                None => return StreamEnd::Ended,
                Some(Err(err)) => return StreamEnd::Failed(err),
                Some(Ok(event)) => match self.dispatch_event(event).await {
                    Ok(()) => {}
                    Err(err @ MCPError::EndpointMismatch { .. }) => return StreamEnd::Fatal(err),
                    Err(err) => warn!("Failed to handle stream event: {}", err),
                },
            }
        }
    }

    async fn dispatch_event(&self, event: SseEvent) -> MCPResult<()> {
        match event.event.as_str() {
            ENDPOINT_EVENT => {
                let url = self.resolve_endpoint(&event.data)?;
                info!("Received submission endpoint {}", url);
                self.session.write().endpoint = Some(url.to_string());
                self.endpoint.send_if_modified(|state| {
                    if matches!(state, EndpointState::Failed(_)) {
                        false
                    } else {
                        *state = EndpointState::Ready(url);
                        true
                    }
                });
                Ok(())
            }
            MESSAGE_EVENT => {
                if event.data.len() > self.config.max_message_size {
                    self.router.stats().lock().update_dropped();
                    return Err(MCPError::invalid_message(format!(
                        "Message too large: {} bytes",
                        event.data.len()
                    )));
                }
                self.router.dispatch(&event.data).await
            }
            other => {
                debug!("Ignoring stream event '{}'", other);
                Ok(())
            }
        }
    }

    /// Resolve an announced address against the stream URL and check that it
    /// stays on the same origin
    fn resolve_endpoint(&self, data: &str) -> MCPResult<Url> {
        let url = self.stream_url.join(data.trim())?;
        let expected = self.stream_url.origin();
        let actual = url.origin();
        if expected != actual {
            error!(
                "Security alert: endpoint origin {} does not match stream origin {}",
                actual.ascii_serialization(),
                expected.ascii_serialization()
            );
            return Err(MCPError::endpoint_mismatch(
                expected.ascii_serialization(),
                actual.ascii_serialization(),
            ));
        }
        Ok(url)
    }

    async fn wait_for_endpoint(&self, cancel: &CancellationToken) -> MCPResult<Url> {
        let mut rx = self.endpoint.subscribe();
        let timeout = self.config.endpoint_timeout;

        let waited = tokio::select! {
            _ = cancel.cancelled() => Err(MCPError::Cancelled),
            _ = tokio::time::sleep(timeout) => {
                Err(MCPError::timeout(timeout.as_millis() as u64))
            }
            state = rx.wait_for(|s| !matches!(s, EndpointState::Pending)) => match state {
                Ok(state) => match &*state {
                    EndpointState::Ready(url) => Ok(url.clone()),
                    EndpointState::Failed(err) => Err(err.clone()),
                    EndpointState::Pending => Err(MCPError::invalid_state("endpoint still pending")),
                },
                Err(_) => Err(MCPError::Closed),
            },
        };

        if let Err(err) = &waited {
            if matches!(err, MCPError::Timeout { .. }) {
                error!("No endpoint event within {:?}", timeout);
            }
        }
        waited
    }

    fn current_endpoint(&self) -> MCPResult<Url> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MCPError::Closed);
        }
        if !self.session.read().initialized {
            return Err(MCPError::NotInitialized);
        }
        match &*self.endpoint.borrow() {
            EndpointState::Ready(url) => Ok(url.clone()),
            EndpointState::Failed(err) => Err(err.clone()),
            EndpointState::Pending => Err(MCPError::invalid_state(
                "submission endpoint not yet announced",
            )),
        }
    }

    /// Fail the session closed: waiters get `err`, later calls are refused
    fn fail_session(&self, err: MCPError) {
        error!("Event-stream session failed: {}", err);
        *self.status.write() = ConnectionStatus::Failed(err.to_string());
        self.endpoint.send_replace(EndpointState::Failed(err.clone()));
        self.router.pending().fail_all(err);
        self.router.pending().close();
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self, cancel: &CancellationToken) -> MCPResult<Session> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MCPError::Closed);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(MCPError::invalid_state("transport already started"));
        }

        info!("Connecting to event stream: {}", self.inner.stream_url);
        *self.inner.status.write() = ConnectionStatus::Connecting;

        match self.start_inner(cancel).await {
            Ok(session) => Ok(session),
            Err(err) => {
                if !self.inner.closed.load(Ordering::SeqCst) {
                    *self.inner.status.write() = ConnectionStatus::Failed(err.to_string());
                }
                // Stop the reader if it was already running
                self.inner.shutdown.cancel();
                self.inner.router.pending().close();
                Err(err)
            }
        }
    }

    async fn send(&self, notification: JsonRpcNotification) -> MCPResult<()> {
        let url = self.inner.current_endpoint()?;
        let body = serde_json::to_string(&notification)?;
        self.inner.router.stats().lock().update_sent(body.len());

        debug!("Sending notification {}", notification.method);
        self.inner.submitter.post(&url, body).await?.expect_no_content()
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> MCPResult<JsonRpcResponse> {
        let inner = &self.inner;
        let url = inner.current_endpoint()?;
        let pending = inner.router.pending();

        let id = pending.next_id();
        let request = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_string(&request)?;
        if body.len() > inner.config.max_message_size {
            return Err(MCPError::validation(format!(
                "Message too large: {} bytes",
                body.len()
            )));
        }
        let receiver = pending.register(id, method)?;
        inner.router.stats().lock().update_sent(body.len());
        debug!("Sending request {} ({})", id, method);

        // One budget covers the submission and the wait for the reply
        let timeout = inner.config.request_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                pending.remove(id);
                return Err(MCPError::Cancelled);
            }
            _ = inner.shutdown.cancelled() => {
                pending.remove(id);
                return Err(MCPError::Closed);
            }
            _ = tokio::time::sleep_until(deadline) => {
                pending.remove(id);
                warn!("Request {} timed out during submission", id);
                return Err(MCPError::timeout(timeout.as_millis() as u64));
            }
            reply = inner.submitter.post(&url, body) => reply,
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                pending.remove(id);
                return Err(err);
            }
        };

        match reply.status {
            200 | 202 => {
                // A 200 body may carry the response inline
                if reply.status == 200 && !reply.body.trim().is_empty() {
                    if let Err(e) = inner.router.dispatch(&reply.body).await {
                        debug!("Ignoring non JSON-RPC reply body for {}: {}", id, e);
                    }
                }
            }
            status => {
                pending.remove(id);
                return Err(MCPError::http_status(status, reply.body));
            }
        }

        pending
            .wait_until(id, receiver, cancel, deadline, timeout)
            .await
    }

    fn set_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.inner.router.set_handler(handler);
    }

    async fn close(&self) -> MCPResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.shutdown.cancel();
        self.inner.router.pending().close();
        self.inner.endpoint.send_if_modified(|state| {
            if matches!(state, EndpointState::Pending) {
                *state = EndpointState::Failed(MCPError::Closed);
                true
            } else {
                false
            }
        });
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }

        *self.inner.status.write() = ConnectionStatus::Closed;
        info!("Event-stream transport closed");
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.status.read().clone()
    }

    fn session(&self) -> Session {
        self.inner.session.read().clone()
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.inner.router.stats().lock().clone();
        stats.update_uptime();
        stats
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
