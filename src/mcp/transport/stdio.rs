//! Stdio transport binding
//!
//! Line-delimited JSON-RPC over a pair of byte pipes: either a spawned child
//! process (the configured endpoint is its command line) or any
//! reader/writer pair supplied by the caller.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::{
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    ConnectionStatus, MessageRouter, NotificationHandler, Transport, TransportConfig,
    TransportStats,
};
use crate::mcp::{
    errors::{MCPError, MCPResult},
    handshake::{Handshake, HandshakeChannel, HandshakeConfig, Session},
    protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Split a command line into program and arguments
pub fn parse_command(command: &str) -> MCPResult<(String, Vec<String>)> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| MCPError::configuration("Empty command"))?
        .to_string();
    let args = parts.map(str::to_string).collect();
    Ok((program, args))
}

struct StdioInner {
    config: TransportConfig,
    handshake_config: HandshakeConfig,
    router: MessageRouter,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    session: RwLock<Session>,
    status: RwLock<ConnectionStatus>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// Stdio transport implementation for local process communication
pub struct StdioTransport {
    inner: Arc<StdioInner>,
    /// Caller-supplied pipes, consumed by `start`
    pipes: Mutex<Option<(BoxedReader, BoxedWriter)>>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl StdioTransport {
    /// Transport that spawns the configured command on `start`
    pub fn new(config: TransportConfig, handshake_config: HandshakeConfig) -> MCPResult<Self> {
        parse_command(&config.endpoint)?;
        Ok(Self::build(config, handshake_config, None))
    }

    /// Transport over an existing pair of pipes
    pub fn with_pipes<R, W>(
        config: TransportConfig,
        handshake_config: HandshakeConfig,
        reader: R,
        writer: W,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(
            config,
            handshake_config,
            Some((Box::new(reader), Box::new(writer))),
        )
    }

    fn build(
        config: TransportConfig,
        handshake_config: HandshakeConfig,
        pipes: Option<(BoxedReader, BoxedWriter)>,
    ) -> Self {
        let session = Session::new(&config.client_id, handshake_config.capabilities.clone());
        Self {
            inner: Arc::new(StdioInner {
                config,
                handshake_config,
                router: MessageRouter::new(),
                writer: tokio::sync::Mutex::new(None),
                session: RwLock::new(session),
                status: RwLock::new(ConnectionStatus::Disconnected),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
            pipes: Mutex::new(pipes),
            child: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    async fn spawn_process(&self) -> MCPResult<(BoxedReader, BoxedWriter)> {
        let (program, args) = parse_command(&self.inner.config.endpoint)?;
        info!("Starting process: {} {:?}", program, args);

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MCPError::connection(format!("Failed to start process: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MCPError::connection("Failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MCPError::connection("Failed to get stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let handle = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "mcp_session::server_stderr", "{}", line);
                }
            });
            self.tasks.lock().push(handle);
        }

        *self.child.lock().await = Some(child);
        Ok((Box::new(stdout), Box::new(stdin)))
    }

    async fn start_inner(&self, cancel: &CancellationToken) -> MCPResult<Session> {
        let pipes = self.pipes.lock().take();
        let (reader, writer) = match pipes {
            Some(pipes) => pipes,
            None => self.spawn_process().await?,
        };
        *self.inner.writer.lock().await = Some(writer);
        self.inner.router.stats().lock().update_connection(true);

        let reader_inner = self.inner.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            reader_inner.run_reader(reader).await;
        }));

        let channel = StdioHandshakeChannel {
            inner: &self.inner,
            cancel,
        };
        let mut handshake = Handshake::new(self.inner.handshake_config.clone());
        let id = self.inner.router.pending().next_id();
        let negotiated = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MCPError::Cancelled),
            _ = self.inner.shutdown.cancelled() => return Err(MCPError::Closed),
            result = handshake.perform(&channel, id) => result?,
        };

        let session = {
            let mut session = self.inner.session.write();
            session.record(&negotiated);
            session.clone()
        };
        *self.inner.status.write() = ConnectionStatus::Connected;
        info!(
            "Stdio session ready (protocol {})",
            negotiated.protocol_version
        );
        Ok(session)
    }

    async fn shutdown_process(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
            info!("Child process terminated");
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl StdioInner {
    async fn write_line(&self, body: String) -> MCPResult<()> {
        if body.len() > self.config.max_message_size {
            return Err(MCPError::validation(format!(
                "Message too large: {} bytes",
                body.len()
            )));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(MCPError::Closed)?;
        let written = async {
            writer.write_all(body.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                self.router.stats().lock().update_sent(body.len() + 1);
                Ok(())
            }
            Err(e) => Err(MCPError::connection(format!(
                "Failed to write to server: {}",
                e
            ))),
        }
    }

    /// Register, write and wait
    async fn call(
        &self,
        request: JsonRpcRequest,
        cancel: &CancellationToken,
    ) -> MCPResult<JsonRpcResponse> {
        let pending = self.router.pending();
        let id = request.id;
        let receiver = pending.register(id, &request.method)?;
        let body = serde_json::to_string(&request)?;

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MCPError::Cancelled),
            _ = self.shutdown.cancelled() => Err(MCPError::Closed),
            written = self.write_line(body) => written,
        };
        if let Err(err) = written {
            pending.remove(id);
            return Err(err);
        }

        pending
            .wait(id, receiver, cancel, self.config.request_timeout)
            .await
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

    async fn run_reader(self: Arc<Self>, reader: BoxedReader) {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        let cause = loop {
            buf.clear();
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                read = reader.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => {
                    debug!("Process stdout closed");
                    break MCPError::connection("server closed its output");
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let raw = line.trim();
                    if raw.is_empty() {
                        continue;
                    }
                    if raw.len() > self.config.max_message_size {
                        warn!("Message too large: {} bytes", raw.len());
                        self.router.stats().lock().update_dropped();
                        continue;
                    }
                    if let Err(e) = self.handle_line(raw).await {
                        warn!("Failed to handle inbound message: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to read from stdout: {}", e);
                    break MCPError::connection(format!("failed to read from server: {}", e));
                }
            }
        };

        self.fail_session(cause);
    }

    async fn handle_line(&self, raw: &str) -> MCPResult<()> {
        self.router.stats().lock().update_received(raw.len());
        let message = match JsonRpcMessage::from_json(raw) {
            Ok(message) => message,
            Err(e) => {
                self.router.stats().lock().update_dropped();
                return Err(e);
            }
        };

        if let JsonRpcMessage::Notification(notification) = &message {
            if !self.session.read().initialized {
                debug!(
                    "Dropping notification {} received before initialization",
                    notification.method
                );
                self.router.stats().lock().update_dropped();
                return Ok(());
            }
        }
        self.router.route(message).await
    }

    fn fail_session(&self, err: MCPError) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        error!("Stdio session failed: {}", err);
        *self.status.write() = ConnectionStatus::Failed(err.to_string());
        self.router.pending().fail_all(err);
        self.router.pending().close();
        self.shutdown.cancel();
    }
}

struct StdioHandshakeChannel<'a> {
    inner: &'a StdioInner,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl HandshakeChannel for StdioHandshakeChannel<'_> {
    async fn initialize(&self, request: JsonRpcRequest) -> MCPResult<JsonRpcResponse> {
        self.inner.call(request, self.cancel).await
    }

    async fn initialized(&self, notification: JsonRpcNotification) -> MCPResult<()> {
        self.inner
            .write_line(serde_json::to_string(&notification)?)
            .await
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self, cancel: &CancellationToken) -> MCPResult<Session> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MCPError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MCPError::invalid_state("transport already started"));
        }
        *self.inner.status.write() = ConnectionStatus::Connecting;

        match self.start_inner(cancel).await {
            Ok(session) => Ok(session),
            Err(err) => {
                if !self.inner.closed.load(Ordering::SeqCst) {
                    *self.inner.status.write() = ConnectionStatus::Failed(err.to_string());
                }
                self.inner.shutdown.cancel();
                self.inner.router.pending().close();
                self.shutdown_process().await;
                Err(err)
            }
        }
    }

    async fn send(&self, notification: JsonRpcNotification) -> MCPResult<()> {
        self.inner.ensure_ready()?;
        debug!("Sending notification {}", notification.method);
        self.inner
            .write_line(serde_json::to_string(&notification)?)
            .await
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> MCPResult<JsonRpcResponse> {
        self.inner.ensure_ready()?;
        let id = self.inner.router.pending().next_id();
        debug!("Sending request {} ({})", id, method);
        self.inner
            .call(JsonRpcRequest::new(id, method, params), cancel)
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
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.shutdown_process().await;

        *self.inner.status.write() = ConnectionStatus::Closed;
        info!("Stdio transport closed");
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

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::TransportType;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{duplex, split, DuplexStream};

    struct Recorder(Mutex<Vec<JsonRpcNotification>>);

    #[async_trait]
    impl NotificationHandler for Recorder {
        async fn handle_notification(&self, notification: JsonRpcNotification) -> MCPResult<()> {
            self.0.lock().push(notification);
            Ok(())
        }
    }

    fn config() -> TransportConfig {
        TransportConfig {
            transport_type: TransportType::Stdio,
            endpoint: "mcp-server".into(),
            client_id: "stdio-client".into(),
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn init_result(id: &Value) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "serverInfo": {"name": "scripted", "version": "0.1"}
            }
        })
        .to_string()
    }

    /// Server side of a duplex pipe: answers each inbound line with the
    /// lines `reply` returns; collects everything it received
    fn scripted_server<F>(stream: DuplexStream, mut reply: F) -> JoinHandle<Vec<Value>>
    where
        F: FnMut(&Value) -> Vec<String> + Send + 'static,
    {
        tokio::spawn(async move {
            let (read, mut write) = split(stream);
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let message: Value = serde_json::from_str(&line).unwrap();
                for out in reply(&message) {
                    if write.write_all(format!("{}\n", out).as_bytes()).await.is_err() {
                        return seen;
                    }
                }
                seen.push(message);
            }
            seen
        })
    }

    fn transport_over(stream: DuplexStream) -> StdioTransport {
        let (read, write) = split(stream);
        StdioTransport::with_pipes(config(), HandshakeConfig::default(), read, write)
    }

    #[test]
    fn test_parse_command() {
        let (program, args) = parse_command("python  server.py --port 9").unwrap();
        assert_eq!(program, "python");
        assert_eq!(args, vec!["server.py", "--port", "9"]);
        assert!(parse_command("   ").is_err());
    }

    #[tokio::test]
    async fn test_handshake_request_and_notification() {
        let (client, server) = duplex(64 * 1024);
        let server = scripted_server(server, |message| match message["method"].as_str() {
            Some("initialize") => vec![
                // Arrives before the session is initialized and is dropped
                json!({"jsonrpc": "2.0", "method": "context/clear"}).to_string(),
                init_result(&message["id"]),
            ],
            Some("tools/list") => vec![
                json!({"jsonrpc": "2.0", "method": "memory/append", "params": {}}).to_string(),
                json!({"jsonrpc": "2.0", "id": message["id"], "result": {"tools": []}}).to_string(),
            ],
            _ => vec![],
        });

        let transport = transport_over(client);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        transport.set_notification_handler(recorder.clone());

        let session = transport.start(&CancellationToken::new()).await.unwrap();
        assert!(session.initialized);
        assert_eq!(session.server_info.unwrap().name, "scripted");

        let response = transport
            .send_request("tools/list", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!({"tools": []})));

        let methods: Vec<_> = recorder.0.lock().iter().map(|n| n.method.clone()).collect();
        assert_eq!(methods, vec!["memory/append".to_string()]);
        assert_eq!(transport.stats().dropped_messages, 1);

        transport.close().await.unwrap();
        let seen = server.await.unwrap();
        assert_eq!(seen[0]["method"], "initialize");
        assert_eq!(seen[1]["method"], "notifications/initialized");
        assert!(seen[1].get("id").is_none());
        assert_eq!(seen[2]["method"], "tools/list");
    }

    #[tokio::test]
    async fn test_responses_matched_out_of_order() {
        let (client, server) = duplex(64 * 1024);
        let mut held: Option<Value> = None;
        let _server = scripted_server(server, move |message| {
            match message["method"].as_str() {
                Some("initialize") => vec![init_result(&message["id"])],
                Some("first") => {
                    held = Some(message["id"].clone());
                    vec![]
                }
                Some("second") => {
                    let first = held.take().unwrap();
                    vec![
                        json!({"jsonrpc": "2.0", "id": message["id"], "result": "second"}).to_string(),
                        json!({"jsonrpc": "2.0", "id": first, "result": "first"}).to_string(),
                    ]
                }
                _ => vec![],
            }
        });

        let transport = Arc::new(transport_over(client));
        transport.start(&CancellationToken::new()).await.unwrap();

        let first = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .send_request("first", None, &CancellationToken::new())
                    .await
            })
        };
        while transport.inner.router.pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let second = transport
            .send_request("second", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(second.result, Some(json!("second")));
        assert_eq!(first.await.unwrap().unwrap().result, Some(json!("first")));
    }

    #[tokio::test]
    async fn test_server_exit_fails_waiters() {
        let (client, server) = duplex(64 * 1024);
        let server = scripted_server(server, |message| match message["method"].as_str() {
            Some("initialize") => vec![init_result(&message["id"])],
            _ => vec![],
        });

        let transport = Arc::new(transport_over(client));
        transport.start(&CancellationToken::new()).await.unwrap();

        let caller = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .send_request("hang", None, &CancellationToken::new())
                    .await
            })
        };
        while transport.inner.router.pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        server.abort();

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, MCPError::Connection { .. }));
        assert!(matches!(transport.status(), ConnectionStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_oversized_and_garbage_lines_are_skipped() {
        let (client, server) = duplex(64 * 1024);
        let _server = scripted_server(server, |message| match message["method"].as_str() {
            Some("initialize") => vec![
                "not json".to_string(),
                String::new(),
                format!("{{\"pad\":\"{}\"}}", "x".repeat(600)),
                init_result(&message["id"]),
            ],
            _ => vec![],
        });

        let (read, write) = split(client);
        let config = TransportConfig {
            max_message_size: 512,
            ..config()
        };
        let transport =
            StdioTransport::with_pipes(config, HandshakeConfig::default(), read, write);
        transport.start(&CancellationToken::new()).await.unwrap();

        assert_eq!(transport.stats().dropped_messages, 2);
    }

    #[tokio::test]
    async fn test_handshake_times_out_without_reply() {
        let (client, server) = duplex(64 * 1024);
        let _server = scripted_server(server, |_| vec![]);

        let (read, write) = split(client);
        let config = TransportConfig {
            request_timeout: Duration::from_millis(100),
            ..config()
        };
        let transport =
            StdioTransport::with_pipes(config, HandshakeConfig::default(), read, write);

        let err = transport.start(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, MCPError::timeout(100));
        assert!(!transport.session().initialized);
    }

    #[tokio::test]
    async fn test_missing_program_fails_start() {
        let config = TransportConfig {
            endpoint: "definitely-not-an-installed-mcp-server --flag".into(),
            ..config()
        };
        let transport = StdioTransport::new(config, HandshakeConfig::default()).unwrap();

        let err = transport.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MCPError::Connection { .. }));
        assert!(matches!(transport.status(), ConnectionStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_send_before_start_is_rejected() {
        let (client, _server) = duplex(1024);
        let transport = transport_over(client);
        assert_eq!(
            transport.send(JsonRpcNotification::new("x")).await,
            Err(MCPError::NotInitialized)
        );
    }
}
