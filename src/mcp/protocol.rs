//! MCP Protocol Core
//!
//! JSON-RPC 2.0 envelopes and the Model Context Protocol payloads exchanged
//! during the session lifecycle.
//!
//! Incoming bytes are classified explicitly (request / notification /
//! response) instead of relying on untagged deserialization, so a malformed
//! envelope is reported as such rather than silently matching the wrong shape.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::{
    cmp::Ordering,
    fmt::{self, Display},
    str::FromStr,
};

use super::errors::{MCPError, MCPResult};

/// JSON-RPC protocol version carried by every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol versions this client can speak, oldest first
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26"];

/// Request identifier. Allocated by the session, monotonic and never reused.
pub type RequestId = i64;

/// Request method names
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";

    /// Sent by the client once the initialize exchange succeeded
    pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
}

/// MCP protocol version identifier.
///
/// Versions are ISO dates (`YYYY-MM-DD`), so lexical order is chronological.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(String);

impl ProtocolVersion {
    /// Create a protocol version from its wire form
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Latest version supported by this crate
    pub fn latest() -> Self {
        let latest = SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .max()
            .copied()
            .unwrap_or("2024-11-05");
        Self::new(latest)
    }

    /// All versions supported by this crate
    pub fn supported() -> Vec<Self> {
        SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .map(|v| Self::new(*v))
            .collect()
    }

    /// Get the version as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the version has the `YYYY-MM-DD` shape
    pub fn is_well_formed(&self) -> bool {
        let bytes = self.0.as_bytes();
        bytes.len() == 10
            && bytes[4] == b'-'
            && bytes[7] == b'-'
            && bytes
                .iter()
                .enumerate()
                .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit())
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProtocolVersion {
    type Err = MCPError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let version = Self::new(s.trim());
        if version.is_well_formed() {
            Ok(version)
        } else {
            Err(MCPError::configuration(format!(
                "Invalid protocol version '{}': expected YYYY-MM-DD",
                s
            )))
        }
    }
}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProtocolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// Standard JSON-RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Parse error
    ParseError = -32700,
    /// Invalid request
    InvalidRequest = -32600,
    /// Method not found
    MethodNotFound = -32601,
    /// Invalid parameters
    InvalidParams = -32602,
    /// Internal error
    InternalError = -32603,
    /// Implementation-defined server error
    ServerError = -32000,
}

impl ErrorCode {
    /// Default message for the code
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::ServerError => "Server error",
        }
    }

    /// Map a numeric code back to a standard code
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            -32099..=-32000 => Some(ErrorCode::ServerError),
            _ => None,
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error object; an empty message falls back to the code's default
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code: code as i32,
            message: if message.is_empty() {
                code.message().to_string()
            } else {
                message
            },
            data: None,
        }
    }

    /// Attach additional data
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Method '{}' not found", method.into()),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, message)
    }
}

impl Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// JSON-RPC request message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    /// Request ID
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Request parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new request
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Validate the request structure
    pub fn validate(&self) -> MCPResult<()> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(MCPError::invalid_message("Invalid JSON-RPC version"));
        }
        if self.method.is_empty() {
            return Err(MCPError::invalid_message("Method name cannot be empty"));
        }
        Ok(())
    }
}

/// JSON-RPC response message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    /// ID of the request being answered; absent when the peer could not read it
    #[serde(default)]
    pub id: Option<RequestId>,
    /// Response result (success). A present `null` result is kept as `Some(Null)`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    /// Response error (failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl JsonRpcResponse {
    /// Create a successful response
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Validate the response structure: exactly one of result/error
    pub fn validate(&self) -> MCPResult<()> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(MCPError::invalid_message("Invalid JSON-RPC version"));
        }
        match (&self.result, &self.error) {
            (Some(_), Some(_)) => Err(MCPError::invalid_message(
                "Response cannot have both result and error",
            )),
            (None, None) => Err(MCPError::invalid_message(
                "Response must have either result or error",
            )),
            _ => Ok(()),
        }
    }

    /// Consume the response, yielding the result or the peer's error
    pub fn into_result(self) -> MCPResult<Value> {
        if let Some(error) = self.error {
            return Err(MCPError::Protocol(error));
        }
        self.result
            .ok_or_else(|| MCPError::invalid_message("Response missing 'result' field"))
    }
}

/// JSON-RPC notification message (no response expected)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Notification parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a notification without parameters
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: None,
        }
    }

    /// Create a notification with parameters
    pub fn with_params(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
        }
    }

    /// Parameters, or JSON `null` when absent
    pub fn params_or_null(&self) -> Value {
        self.params.clone().unwrap_or(Value::Null)
    }
}

/// Any JSON-RPC message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Parse and classify a JSON string
    pub fn from_json(json: &str) -> MCPResult<Self> {
        let value: Value = serde_json::from_str(json).map_err(|e| {
            MCPError::invalid_message(format!("Failed to parse JSON-RPC message: {}", e))
        })?;
        Self::from_value(value)
    }

    /// Classify an already decoded JSON value
    pub fn from_value(value: Value) -> MCPResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| MCPError::invalid_message("JSON-RPC message must be an object"))?;

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(MCPError::invalid_message("Invalid JSON-RPC version"));
        }

        let has_method = object.contains_key("method");
        let has_id = object.get("id").map_or(false, |id| !id.is_null());
        let is_response = object.contains_key("result") || object.contains_key("error");

        let message = match (has_method, has_id, is_response) {
            (true, true, _) => JsonRpcMessage::Request(serde_json::from_value(value)?),
            (true, false, _) => JsonRpcMessage::Notification(serde_json::from_value(value)?),
            (false, _, true) => {
                let response: JsonRpcResponse = serde_json::from_value(value)?;
                response.validate()?;
                JsonRpcMessage::Response(response)
            }
            _ => {
                return Err(MCPError::invalid_message(
                    "Message is neither a request, a notification nor a response",
                ))
            }
        };

        Ok(message)
    }

    /// Serialize message to JSON string
    pub fn to_json(&self) -> MCPResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Get the method name (for requests and notifications)
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(req) => Some(&req.method),
            JsonRpcMessage::Notification(notif) => Some(&notif.method),
            JsonRpcMessage::Response(_) => None,
        }
    }

    /// Get the message ID (for requests and responses)
    pub fn id(&self) -> Option<RequestId> {
        match self {
            JsonRpcMessage::Request(req) => Some(req.id),
            JsonRpcMessage::Response(res) => res.id,
            JsonRpcMessage::Notification(_) => None,
        }
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(request)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notification: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(notification)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(response)
    }
}

/// Name and version of a protocol participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Client information sent in `initialize`
pub type ClientInfo = Implementation;

/// Server information returned by `initialize`
pub type ServerInfo = Implementation;

/// Roots capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub list_changed: bool,
}

/// Empty-object capability marker (`{}` means supported)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyCapability {}

/// Capabilities offered by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<EmptyCapability>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub experimental: Map<String, Value>,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            roots: Some(RootsCapability { list_changed: true }),
            sampling: Some(EmptyCapability {}),
            experimental: Map::new(),
        }
    }
}

/// Prompt / tool capabilities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChangedCapability {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub list_changed: bool,
}

/// Resource capabilities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCapabilities {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub subscribe: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub list_changed: bool,
}

/// Capabilities announced by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<EmptyCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListChangedCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceCapabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListChangedCapability>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub experimental: Map<String, Value>,
}

/// `initialize` request parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: ProtocolVersion,
    pub capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

/// `initialize` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_version_ordering() {
        let older = ProtocolVersion::new("2024-11-05");
        let newer = ProtocolVersion::new("2025-03-26");

        assert!(newer > older);
        assert_eq!(ProtocolVersion::latest(), newer);
        assert_eq!(ProtocolVersion::supported(), vec![older, newer]);
    }

    #[test]
    fn test_protocol_version_parsing() {
        let version: ProtocolVersion = "2025-03-26".parse().unwrap();
        assert_eq!(version.as_str(), "2025-03-26");
        assert!("1.0".parse::<ProtocolVersion>().is_err());
        assert!("2025-3-26".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_request_serialization() {
        let request = JsonRpcRequest::new(7, "tools/list", None);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json, json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_classify_messages() {
        let request = JsonRpcMessage::from_json(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
        )
        .unwrap();
        assert!(matches!(request, JsonRpcMessage::Request(_)));

        let notification = JsonRpcMessage::from_json(
            r#"{"jsonrpc":"2.0","method":"context/update","params":{"id":"c1"}}"#,
        )
        .unwrap();
        assert_eq!(notification.method(), Some("context/update"));
        assert_eq!(notification.id(), None);

        let response = JsonRpcMessage::from_json(
            r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#,
        )
        .unwrap();
        assert_eq!(response.id(), Some(3));
    }

    #[test]
    fn test_null_result_is_present() {
        let message =
            JsonRpcMessage::from_json(r#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap();
        match message {
            JsonRpcMessage::Response(response) => {
                assert_eq!(response.result, Some(Value::Null));
                assert_eq!(response.into_result().unwrap(), Value::Null);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_envelopes_are_rejected() {
        assert!(JsonRpcMessage::from_json("not json").is_err());
        assert!(JsonRpcMessage::from_json("[1,2]").is_err());
        assert!(JsonRpcMessage::from_json(r#"{"jsonrpc":"1.0","method":"x"}"#).is_err());
        assert!(JsonRpcMessage::from_json(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
        assert!(JsonRpcMessage::from_json(
            r#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":-32603,"message":"x"}}"#
        )
        .is_err());
    }

    #[test]
    fn test_response_into_result() {
        let ok = JsonRpcResponse::success(1, json!({"tools": []}));
        assert!(ok.is_success());
        assert_eq!(ok.into_result().unwrap(), json!({"tools": []}));

        let failed = JsonRpcResponse::failure(2, JsonRpcError::method_not_found("nope"));
        assert!(failed.is_error());
        match failed.into_result() {
            Err(MCPError::Protocol(err)) => {
                assert_eq!(err.code, ErrorCode::MethodNotFound as i32)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_error_code_defaults() {
        let err = JsonRpcError::new(ErrorCode::InvalidParams, "");
        assert_eq!(err.message, "Invalid params");
        assert_eq!(ErrorCode::from_code(-32700), Some(ErrorCode::ParseError));
        assert_eq!(ErrorCode::from_code(-32050), Some(ErrorCode::ServerError));
        assert_eq!(ErrorCode::from_code(42), None);
    }

    #[test]
    fn test_initialize_params_wire_names() {
        let params = InitializeParams {
            protocol_version: ProtocolVersion::latest(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::new("client", "1.0.0"),
        };
        let json = serde_json::to_value(&params).unwrap();

        assert_eq!(json["protocolVersion"], "2025-03-26");
        assert_eq!(json["clientInfo"]["name"], "client");
        assert_eq!(json["capabilities"]["roots"]["listChanged"], true);
        assert_eq!(json["capabilities"]["sampling"], json!({}));
    }
}
