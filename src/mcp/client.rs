//! MCP Client Implementation
//!
//! Composes a transport session, the context store fed by inbound
//! notifications and the tool validation gate into one client. Every tool
//! call crosses the gate twice: arguments before transmission and the
//! result before it is handed back.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    context::{Context, ContextStore, MemoryBlock},
    errors::{MCPError, MCPResult},
    handshake::{HandshakeConfig, Session},
    notifications::NotificationRouter,
    protocol::{methods, JsonRpcNotification},
    tools::{
        guard_output_with_outcome, validate_call_schema, ExecutionStatus, HiddenContentPolicy,
        ListToolsResult, ToolCall, ToolDescription, ToolRegistry, ToolResult,
        WITHHELD_OUTPUT_MESSAGE,
    },
    transport::{
        ConnectionStatus, NotificationHandler, Transport, TransportConfig, TransportFactory,
        TransportStats,
    },
};

/// MCP client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McpClientConfig {
    /// Transport configuration
    pub transport: TransportConfig,
    /// Versions offered and capabilities advertised during the handshake
    pub handshake: HandshakeConfig,
    /// Applied to tool arguments, outputs and descriptions
    pub hidden_content_policy: HiddenContentPolicy,
}

/// Client statistics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ClientStats {
    /// Total requests sent
    pub requests_sent: u64,
    /// Total responses received
    pub responses_received: u64,
    /// Total notifications handled
    pub notifications_received: u64,
    /// Failed requests
    pub failed_requests: u64,
    /// Timed out requests
    pub timeout_requests: u64,
    /// Cancelled requests
    pub cancelled_requests: u64,
    /// Tool calls refused by the validation gate
    pub rejected_tool_calls: u64,
    /// Average response time
    pub average_response_time: Duration,
    /// Last activity timestamp
    pub last_activity: Option<DateTime<Utc>>,
}

impl ClientStats {
    /// Update request statistics
    pub fn update_request(&mut self, success: bool, response_time: Duration) {
        self.requests_sent += 1;
        if success {
            self.responses_received += 1;
            let n = self.responses_received as u128;
            let total = self.average_response_time.as_nanos() * (n - 1) + response_time.as_nanos();
            self.average_response_time = Duration::from_nanos((total / n) as u64);
        } else {
            self.failed_requests += 1;
        }
        self.last_activity = Some(Utc::now());
    }

    /// Update timeout statistics
    pub fn update_timeout(&mut self) {
        self.timeout_requests += 1;
    }

    pub fn update_cancelled(&mut self) {
        self.cancelled_requests += 1;
    }

    /// Get success rate
    pub fn success_rate(&self) -> f64 {
        if self.requests_sent == 0 {
            0.0
        } else {
            self.responses_received as f64 / self.requests_sent as f64
        }
    }
}

/// MCP client implementation
pub struct McpClient {
    config: McpClientConfig,
    transport: Arc<dyn Transport>,
    notifications: Arc<NotificationRouter>,
    registry: RwLock<ToolRegistry>,
    stats: Mutex<ClientStats>,
}

impl McpClient {
    /// Create a client over the transport selected by the configuration
    pub fn new(config: McpClientConfig) -> MCPResult<Self> {
        config.handshake.validate()?;
        let transport =
            TransportFactory::create(config.transport.clone(), config.handshake.clone())?;
        Ok(Self::with_transport(config, transport))
    }

    /// Create a client over an existing transport
    pub fn with_transport(config: McpClientConfig, transport: Arc<dyn Transport>) -> Self {
        let store = Arc::new(ContextStore::new());
        let notifications = Arc::new(NotificationRouter::new(
            config.transport.client_id.clone(),
            store,
        ));
        transport.set_notification_handler(notifications.clone());

        Self {
            config,
            transport,
            notifications,
            registry: RwLock::new(ToolRegistry::new()),
            stats: Mutex::new(ClientStats::default()),
        }
    }

    /// Run the handshake and bring the session up
    pub async fn connect(&self, cancel: &CancellationToken) -> MCPResult<Session> {
        info!(
            "Connecting MCP client {} ({:?})",
            self.identity(),
            self.config.transport.transport_type
        );
        let session = self.transport.start(cancel).await?;
        info!(
            "MCP client ready, protocol {}",
            session
                .protocol_version
                .as_ref()
                .map(|v| v.as_str())
                .unwrap_or("unknown")
        );
        Ok(session)
    }

    /// Issue a request and return its result
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> MCPResult<Value> {
        let start = Instant::now();
        let outcome = match self.transport.send_request(method, params, cancel).await {
            Ok(response) => response.into_result(),
            Err(e) => Err(e),
        };

        let mut stats = self.stats.lock();
        stats.update_request(outcome.is_ok(), start.elapsed());
        match &outcome {
            Err(MCPError::Timeout { .. }) => stats.update_timeout(),
            Err(MCPError::Cancelled) => stats.update_cancelled(),
            Err(e) => debug!("Request {} failed: {}", method, e),
            Ok(_) => {}
        }
        outcome
    }

    /// Send a notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> MCPResult<()> {
        let notification = match params {
            Some(params) => JsonRpcNotification::with_params(method, params),
            None => JsonRpcNotification::new(method),
        };
        self.transport.send(notification).await
    }

    /// Ping the server
    pub async fn ping(&self, cancel: &CancellationToken) -> MCPResult<Duration> {
        let start = Instant::now();
        self.request(methods::PING, None, cancel).await?;
        Ok(start.elapsed())
    }

    /// List the server's tools, following pagination, and replace the
    /// registry with the permitted ones.
    ///
    /// Under [`HiddenContentPolicy::Reject`] a tool whose name or
    /// description hides characters is left out of the registry.
    pub async fn list_tools(&self, cancel: &CancellationToken) -> MCPResult<Vec<ToolDescription>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.request(methods::TOOLS_LIST, params, cancel).await?;
            let page: ListToolsResult = serde_json::from_value(result).map_err(|e| {
                MCPError::invalid_message(format!("Invalid tools/list result: {}", e))
            })?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => break,
            }
        }

        let mut registry: ToolRegistry = tools.into_iter().collect();
        let policy = self.config.hidden_content_policy;
        for (name, findings) in registry.audit_descriptions() {
            let subject = format!("description of tool '{}'", name);
            if policy.enforce(&subject, findings).is_err() {
                warn!("Withholding tool '{}' from the registry", name);
                registry.remove(&name);
            }
        }

        let permitted = registry.descriptions();
        debug!("Registered {} tool(s)", permitted.len());
        *self.registry.write() = registry;
        Ok(permitted)
    }

    /// Register a tool description without querying the server
    pub fn register_tool(&self, tool: ToolDescription) {
        self.registry.write().register(tool);
    }

    /// Snapshot of the permitted tools
    pub fn registry(&self) -> ToolRegistry {
        self.registry.read().clone()
    }

    /// Call a tool through the validation gate.
    ///
    /// Refused arguments return an error without contacting the server. An
    /// output that violates its schema or hides characters is replaced by a
    /// safe error result. Every executed call is recorded in the context's
    /// tool-result history with the outcome handed back.
    pub async fn call_tool(
        &self,
        call: ToolCall,
        cancel: &CancellationToken,
    ) -> MCPResult<ToolResult> {
        let registry = self.registry();
        let policy = self.config.hidden_content_policy;

        let checked = validate_call_schema(&call, &registry)
            .into_result()
            .and_then(|warnings| {
                policy.screen_value(&format!("arguments of tool '{}'", call.name), &call.arguments)?;
                Ok(warnings)
            });
        if let Err(e) = checked {
            self.stats.lock().rejected_tool_calls += 1;
            return Err(e);
        }

        let params = json!({ "name": call.name, "arguments": call.arguments });
        let result = self.request(methods::TOOLS_CALL, Some(params), cancel).await?;
        let result: ToolResult = serde_json::from_value(result).map_err(|e| {
            MCPError::invalid_message(format!("Invalid tools/call result: {}", e))
        })?;

        let (result, outcome) = guard_output_with_outcome(result, &call, &registry);
        let (result, status, error_message) = match outcome.error {
            Some(e) => (result, outcome.status, Some(e.to_string())),
            None => {
                let document = serde_json::to_value(&result)?;
                match policy.screen_value(&format!("output of tool '{}'", call.name), &document) {
                    Err(e) => {
                        error!("Withholding output of tool call {}", call.id);
                        (
                            ToolResult::error(WITHHELD_OUTPUT_MESSAGE),
                            ExecutionStatus::Failed,
                            Some(e.to_string()),
                        )
                    }
                    Ok(_) if result.is_error => {
                        let message = result.text_content();
                        (result, ExecutionStatus::Failed, Some(message))
                    }
                    Ok(_) => (result, ExecutionStatus::Succeeded, None),
                }
            }
        };

        self.context_store().add_tool_result_message(
            self.identity(),
            &call.id,
            &result.text_content(),
            status,
            error_message,
            self.config.transport.transport_type.as_str(),
        );
        Ok(result)
    }

    /// Register an application handler for a notification method
    pub fn register_notification_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) {
        self.notifications.register(method, handler);
    }

    /// Identity of this client's session
    pub fn identity(&self) -> &str {
        self.notifications.identity()
    }

    /// The session's context, created on first access
    pub fn context(&self) -> Context {
        self.context_store().get_or_create(self.identity())
    }

    pub fn context_store(&self) -> &Arc<ContextStore> {
        self.notifications.store()
    }

    /// Record a locally produced assistant response in the session memory
    pub fn append_assistant_response(&self, content: &str) -> MemoryBlock {
        self.context_store()
            .append_assistant_response(self.identity(), content)
    }

    /// Close the session; idempotent
    pub async fn close(&self) -> MCPResult<()> {
        self.transport.close().await
    }

    pub fn session(&self) -> Session {
        self.transport.session()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ConnectionStatus::Connected && self.session().initialized
    }

    /// Get client statistics
    pub fn stats(&self) -> ClientStats {
        let mut stats = self.stats.lock().clone();
        stats.notifications_received = self.notifications.handled();
        stats
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    pub fn config(&self) -> &McpClientConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{
        protocol::{JsonRpcError, JsonRpcResponse},
        transport::MockTransport,
    };

    fn config() -> McpClientConfig {
        McpClientConfig {
            transport: TransportConfig {
                client_id: "tester".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn mock() -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_set_notification_handler().return_const(());
        transport
    }

    fn weather_tool() -> ToolDescription {
        ToolDescription::new("get_weather")
            .with_description("Current weather")
            .with_input_schema(json!({
                "type": "object",
                "properties": {"location": {"type": "string"}},
                "required": ["location"]
            }))
            .with_output_schema(json!({
                "type": "object",
                "properties": {"temperature": {"type": "number"}},
                "required": ["temperature"]
            }))
    }

    #[test]
    fn test_client_stats_average() {
        let mut stats = ClientStats::default();
        stats.update_request(true, Duration::from_millis(10));
        stats.update_request(true, Duration::from_millis(30));
        stats.update_request(false, Duration::from_millis(99));

        assert_eq!(stats.requests_sent, 3);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.average_response_time, Duration::from_millis(20));
        assert!((stats.success_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_request_surfaces_protocol_error() {
        let mut transport = mock();
        transport
            .expect_send_request()
            .withf(|method, _, _| method == "resources/read")
            .returning(|_, _, _| {
                Ok(JsonRpcResponse::failure(
                    1,
                    JsonRpcError::method_not_found("resources/read"),
                ))
            });

        let client = McpClient::with_transport(config(), Arc::new(transport));
        let err = client
            .request("resources/read", None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, MCPError::Protocol(ref e) if e.code == -32601));
        assert_eq!(client.stats().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_timeouts_and_cancellations_counted() {
        let mut transport = mock();
        transport
            .expect_send_request()
            .withf(|method, _, _| method == "slow")
            .times(1)
            .returning(|_, _, _| Err(MCPError::timeout(30_000)));
        transport
            .expect_send_request()
            .withf(|method, _, _| method == "stop")
            .times(1)
            .returning(|_, _, _| Err(MCPError::Cancelled));

        let client = McpClient::with_transport(config(), Arc::new(transport));
        let cancel = CancellationToken::new();
        assert!(client.request("slow", None, &cancel).await.is_err());
        assert!(client.request("stop", None, &cancel).await.is_err());

        let stats = client.stats();
        assert_eq!(stats.timeout_requests, 1);
        assert_eq!(stats.cancelled_requests, 1);
        assert_eq!(stats.failed_requests, 2);
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor_and_withholds_hidden() {
        let mut transport = mock();
        transport
            .expect_send_request()
            .withf(|method, params, _| method == "tools/list" && params.is_none())
            .returning(|_, _, _| {
                Ok(JsonRpcResponse::success(
                    1,
                    json!({
                        "tools": [{"name": "get_weather", "description": "Current weather"}],
                        "nextCursor": "page2"
                    }),
                ))
            });
        transport
            .expect_send_request()
            .withf(|method, params, _| {
                method == "tools/list" && params.as_ref() == Some(&json!({"cursor": "page2"}))
            })
            .returning(|_, _, _| {
                Ok(JsonRpcResponse::success(
                    2,
                    json!({"tools": [{"name": "exfil", "description": "Harmless\u{E0041}\u{E0042}"}]}),
                ))
            });

        let client = McpClient::with_transport(config(), Arc::new(transport));
        let tools = client.list_tools(&CancellationToken::new()).await.unwrap();

        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["get_weather"]);
        assert!(!client.registry().contains("exfil"));
    }

    #[tokio::test]
    async fn test_call_tool_rejects_invalid_arguments_without_sending() {
        let mut transport = mock();
        transport.expect_send_request().never();

        let client = McpClient::with_transport(config(), Arc::new(transport));
        client.register_tool(weather_tool());

        let call = ToolCall::new("get_weather", json!({"location": 42}));
        let err = client
            .call_tool(call, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Input validation failed for tool 'get_weather'"));

        let unknown = ToolCall::new("rm_rf", json!({}));
        let err = client
            .call_tool(unknown, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MCPError::ToolNotFound { .. }));

        let hidden = ToolCall::new("get_weather", json!({"location": "Paris\u{202E}"}));
        let err = client
            .call_tool(hidden, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MCPError::HiddenContent { .. }));
        assert_eq!(client.stats().rejected_tool_calls, 3);
    }

    #[tokio::test]
    async fn test_call_tool_passes_valid_output() {
        let mut transport = mock();
        transport
            .expect_send_request()
            .withf(|method, params, _| {
                method == "tools/call"
                    && params.as_ref().map(|p| p["name"] == "get_weather").unwrap_or(false)
            })
            .returning(|_, _, _| {
                Ok(JsonRpcResponse::success(
                    3,
                    json!({
                        "content": [{"type": "text", "text": "{\"temperature\": 21.5}"}],
                        "structuredContent": {"temperature": 21.5}
                    }),
                ))
            });

        let client = McpClient::with_transport(config(), Arc::new(transport));
        client.register_tool(weather_tool());

        let result = client
            .call_tool(
                ToolCall::new("get_weather", json!({"location": "Paris"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.structured_content, Some(json!({"temperature": 21.5})));

        let messages = client.context().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "{\"temperature\": 21.5}");
        let meta = messages[0].tool_result.as_ref().unwrap();
        assert_eq!(meta.execution_status, ExecutionStatus::Succeeded);
        assert_eq!(meta.execution_env, "sse");
        assert!(meta.error_message.is_none());
    }

    #[tokio::test]
    async fn test_call_tool_withholds_bad_output() {
        let mut transport = mock();
        transport
            .expect_send_request()
            .returning(|_, _, _| {
                Ok(JsonRpcResponse::success(
                    4,
                    json!({"content": [{"type": "text", "text": "{\"temperature\": \"hot\"}"}]}),
                ))
            });

        let client = McpClient::with_transport(config(), Arc::new(transport));
        client.register_tool(weather_tool());

        let call = ToolCall::new("get_weather", json!({"location": "Oslo"}));
        let call_id = call.id.clone();
        let result = client
            .call_tool(call, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.text_content(), WITHHELD_OUTPUT_MESSAGE);

        // History records what was handed back, not the raw output
        let message = client.context().messages.pop().unwrap();
        assert_eq!(message.tool_call_id.as_deref(), Some(call_id.as_str()));
        assert_eq!(message.content, WITHHELD_OUTPUT_MESSAGE);
        let meta = message.tool_result.unwrap();
        assert_eq!(meta.execution_status, ExecutionStatus::Failed);
        assert!(meta.error_message.unwrap().contains("output failed validation"));
    }

    #[tokio::test]
    async fn test_tool_reported_error_recorded_as_failed() {
        let mut transport = mock();
        transport.expect_send_request().returning(|_, _, _| {
            Ok(JsonRpcResponse::success(
                6,
                json!({"content": [{"type": "text", "text": "disk full"}], "isError": true}),
            ))
        });

        let client = McpClient::with_transport(config(), Arc::new(transport));
        client.register_tool(ToolDescription::new("write_file"));

        let result = client
            .call_tool(ToolCall::new("write_file", json!({})), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_error);

        let meta = client.context().messages[0].tool_result.clone().unwrap();
        assert_eq!(meta.execution_status, ExecutionStatus::Failed);
        assert_eq!(meta.error_message.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_warn_policy_lets_hidden_output_through() {
        let mut transport = mock();
        transport.expect_send_request().returning(|_, _, _| {
            Ok(JsonRpcResponse::success(
                5,
                json!({"content": [{"type": "text", "text": "ok\u{200F}"}]}),
            ))
        });

        let config = McpClientConfig {
            hidden_content_policy: HiddenContentPolicy::Warn,
            ..config()
        };
        let client = McpClient::with_transport(config, Arc::new(transport));
        client.register_tool(ToolDescription::new("echo"));

        let result = client
            .call_tool(ToolCall::new("echo", json!({})), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.text_content(), "ok\u{200F}");
    }

    #[tokio::test]
    async fn test_context_follows_identity() {
        let client = McpClient::with_transport(config(), Arc::new(mock()));

        let block = client.append_assistant_response("Hello there");
        let ctx = client.context();
        assert_eq!(client.identity(), "tester");
        assert_eq!(ctx.memory.len(), 1);
        assert_eq!(ctx.memory[0].id, block.id);
        assert_eq!(ctx.memory[0].role, "assistant");
    }

    #[tokio::test]
    async fn test_notifications_reach_context_store() {
        let client = McpClient::with_transport(config(), Arc::new(mock()));
        client
            .notifications
            .handle_notification(JsonRpcNotification::with_params(
                "memory/append",
                json!({"append": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();

        assert_eq!(client.context().memory[0].content, "hi");
        assert_eq!(client.stats().notifications_received, 1);
    }
}
