//! Handshake Coordinator
//!
//! Drives the `initialize` / `notifications/initialized` lifecycle:
//!
//! ```text
//! New -> RequestSent -> AwaitingResponse -> Negotiated -> Initialized
//!   \________________________\__________________\______-> Failed
//! ```
//!
//! The client always offers its latest supported version and never
//! downgrades: a server choice outside the supported set fails the
//! handshake. There are no internal retries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use tracing::{debug, error, info};

use super::{
    errors::{MCPError, MCPResult},
    protocol::{
        methods, ClientCapabilities, ClientInfo, InitializeParams, InitializeResult,
        JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ProtocolVersion, RequestId,
        ServerCapabilities, ServerInfo, SUPPORTED_PROTOCOL_VERSIONS,
    },
};

/// Handshake lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    New,
    RequestSent,
    AwaitingResponse,
    Negotiated,
    Initialized,
    /// Terminal failure with its reason
    Failed(String),
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Initialized | HandshakeState::Failed(_))
    }
}

impl Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::New => f.write_str("new"),
            HandshakeState::RequestSent => f.write_str("request-sent"),
            HandshakeState::AwaitingResponse => f.write_str("awaiting-response"),
            HandshakeState::Negotiated => f.write_str("negotiated"),
            HandshakeState::Initialized => f.write_str("initialized"),
            HandshakeState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Local side of the negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Protocol versions this client accepts
    pub supported_versions: Vec<String>,
    /// Identity announced to the server
    pub client_info: ClientInfo,
    /// Capabilities announced to the server
    pub capabilities: ClientCapabilities,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            client_info: ClientInfo::new("mcp-session", env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilities::default(),
        }
    }
}

impl HandshakeConfig {
    /// Highest supported version, the one offered to the server
    pub fn offered_version(&self) -> MCPResult<ProtocolVersion> {
        self.supported_versions
            .iter()
            .map(ProtocolVersion::new)
            .max()
            .ok_or_else(|| {
                MCPError::configuration("client must support at least one protocol version")
            })
    }

    pub fn supports(&self, version: &ProtocolVersion) -> bool {
        self.supported_versions
            .iter()
            .any(|v| v == version.as_str())
    }

    pub fn validate(&self) -> MCPResult<()> {
        self.offered_version()?;
        for version in &self.supported_versions {
            version.parse::<ProtocolVersion>()?;
        }
        if self.client_info.name.is_empty() {
            return Err(MCPError::configuration("client name cannot be empty"));
        }
        Ok(())
    }
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiatedSession {
    pub protocol_version: ProtocolVersion,
    pub server_capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
}

/// Snapshot of one connection's session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Client identity used for `X-Client-ID` and the context store
    pub identity: String,
    /// Negotiated protocol version, once known
    pub protocol_version: Option<ProtocolVersion>,
    /// Capabilities offered by this client
    pub local_capabilities: ClientCapabilities,
    /// Capabilities announced by the server
    pub remote_capabilities: Option<ServerCapabilities>,
    /// Server identity
    pub server_info: Option<ServerInfo>,
    /// Monotonic false -> true
    pub initialized: bool,
    /// Current submission address
    pub endpoint: Option<String>,
}

impl Session {
    pub fn new(identity: impl Into<String>, local_capabilities: ClientCapabilities) -> Self {
        Self {
            identity: identity.into(),
            protocol_version: None,
            local_capabilities,
            remote_capabilities: None,
            server_info: None,
            initialized: false,
            endpoint: None,
        }
    }

    /// Record the negotiated parameters and mark the session initialized
    pub fn record(&mut self, negotiated: &NegotiatedSession) {
        self.protocol_version = Some(negotiated.protocol_version.clone());
        self.remote_capabilities = Some(negotiated.server_capabilities.clone());
        self.server_info = Some(negotiated.server_info.clone());
        self.initialized = true;
    }
}

/// Channel the handshake is transmitted over
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HandshakeChannel: Send + Sync {
    /// Transmit the initialize request and return the server's response
    async fn initialize(&self, request: JsonRpcRequest) -> MCPResult<JsonRpcResponse>;

    /// Transmit the initialized notification
    async fn initialized(&self, notification: JsonRpcNotification) -> MCPResult<()>;
}

/// Handshake state machine
#[derive(Debug, Clone)]
pub struct Handshake {
    config: HandshakeConfig,
    state: HandshakeState,
    negotiated: Option<NegotiatedSession>,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            state: HandshakeState::New,
            negotiated: None,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    pub fn negotiated(&self) -> Option<&NegotiatedSession> {
        self.negotiated.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.state == HandshakeState::Initialized
    }

    /// Move to `Failed` unless already terminal, returning the error
    pub fn fail(&mut self, error: MCPError) -> MCPError {
        if !self.state.is_terminal() {
            error!("Handshake failed in state {}: {}", self.state, error);
            self.state = HandshakeState::Failed(error.to_string());
        }
        error
    }

    fn expect_state(&self, expected: HandshakeState, action: &str) -> MCPResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(MCPError::invalid_state(format!(
                "cannot {} in handshake state {}",
                action, self.state
            )))
        }
    }

    /// `New -> RequestSent`: build the initialize request
    pub fn build_initialize_request(&mut self, id: RequestId) -> MCPResult<JsonRpcRequest> {
        self.expect_state(HandshakeState::New, "build initialize request")?;

        let offered = match self.config.offered_version() {
            Ok(version) => version,
            Err(e) => return Err(self.fail(e)),
        };

        let params = InitializeParams {
            protocol_version: offered.clone(),
            capabilities: self.config.capabilities.clone(),
            client_info: self.config.client_info.clone(),
        };
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => return Err(self.fail(e.into())),
        };

        debug!("Offering protocol version {}", offered);
        self.state = HandshakeState::RequestSent;
        Ok(JsonRpcRequest::new(id, methods::INITIALIZE, Some(params)))
    }

    /// `RequestSent -> AwaitingResponse`: the request has been transmitted
    pub fn mark_awaiting(&mut self) -> MCPResult<()> {
        self.expect_state(HandshakeState::RequestSent, "await initialize response")?;
        self.state = HandshakeState::AwaitingResponse;
        Ok(())
    }

    /// `AwaitingResponse -> Negotiated`: decode and check the server's answer
    pub fn process_response(&mut self, response: JsonRpcResponse) -> MCPResult<NegotiatedSession> {
        self.expect_state(HandshakeState::AwaitingResponse, "process initialize response")?;

        let result = match response.into_result() {
            Ok(result) if !result.is_null() => result,
            Ok(_) => {
                return Err(self.fail(MCPError::invalid_message(
                    "server response missing 'result' field",
                )))
            }
            Err(e) => return Err(self.fail(e)),
        };

        let result: InitializeResult = match serde_json::from_value(result) {
            Ok(result) => result,
            Err(e) => {
                return Err(self.fail(MCPError::serialization(format!(
                    "failed to decode initialize result: {}",
                    e
                ))))
            }
        };

        if !self.config.supports(&result.protocol_version) {
            let err = MCPError::unsupported_version(
                result.protocol_version.as_str(),
                &self.config.supported_versions,
            );
            return Err(self.fail(err));
        }

        let negotiated = NegotiatedSession {
            protocol_version: result.protocol_version,
            server_capabilities: result.capabilities,
            server_info: result.server_info,
        };
        info!(
            "Negotiated protocol version {} with {} {}",
            negotiated.protocol_version, negotiated.server_info.name, negotiated.server_info.version
        );

        self.state = HandshakeState::Negotiated;
        self.negotiated = Some(negotiated.clone());
        Ok(negotiated)
    }

    /// Build the initialized notification; only valid once negotiated
    pub fn build_initialized_notification(&self) -> MCPResult<JsonRpcNotification> {
        if self.state != HandshakeState::Negotiated || self.negotiated.is_none() {
            return Err(MCPError::invalid_state(
                "cannot send initialized notification before successful handshake",
            ));
        }
        Ok(JsonRpcNotification::new(methods::NOTIFICATION_INITIALIZED))
    }

    /// `Negotiated -> Initialized`: the notification was transmitted
    pub fn mark_initialized(&mut self) -> MCPResult<()> {
        self.expect_state(HandshakeState::Negotiated, "mark session initialized")?;
        self.state = HandshakeState::Initialized;
        Ok(())
    }

    /// Run the whole handshake over `channel`
    pub async fn perform<C>(&mut self, channel: &C, id: RequestId) -> MCPResult<NegotiatedSession>
    where
        C: HandshakeChannel + ?Sized,
    {
        let request = self.build_initialize_request(id)?;
        self.mark_awaiting()?;

        let response = match channel.initialize(request).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e)),
        };
        let negotiated = self.process_response(response)?;

        let notification = self.build_initialized_notification()?;
        if let Err(e) = channel.initialized(notification).await {
            return Err(self.fail(e));
        }
        self.mark_initialized()?;

        info!("Session initialized");
        Ok(negotiated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::JsonRpcError;
    use serde_json::json;

    fn init_result(version: &str) -> serde_json::Value {
        json!({
            "protocolVersion": version,
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "test-server", "version": "0.9.0"}
        })
    }

    #[test]
    fn test_initialize_request_offers_latest_version() {
        let mut handshake = Handshake::new(HandshakeConfig::default());
        let request = handshake.build_initialize_request(1).unwrap();

        assert_eq!(request.method, "initialize");
        let params = request.params.unwrap();
        assert_eq!(params["protocolVersion"], "2025-03-26");
        assert_eq!(params["clientInfo"]["name"], "mcp-session");
        assert_eq!(handshake.state(), &HandshakeState::RequestSent);
    }

    #[test]
    fn test_no_supported_versions_fails() {
        let config = HandshakeConfig {
            supported_versions: vec![],
            ..HandshakeConfig::default()
        };
        let mut handshake = Handshake::new(config);

        assert!(handshake.build_initialize_request(1).is_err());
        assert!(matches!(handshake.state(), HandshakeState::Failed(_)));
    }

    #[test]
    fn test_unsupported_server_version_fails() {
        let mut handshake = Handshake::new(HandshakeConfig::default());
        handshake.build_initialize_request(1).unwrap();
        handshake.mark_awaiting().unwrap();

        let err = handshake
            .process_response(JsonRpcResponse::success(1, init_result("1999-01-01")))
            .unwrap_err();

        assert!(err.to_string().contains("unsupported protocol version '1999-01-01'"));
        assert!(matches!(handshake.state(), HandshakeState::Failed(_)));
        assert!(!handshake.is_initialized());
        assert!(handshake.build_initialized_notification().is_err());
    }

    #[test]
    fn test_older_supported_version_is_accepted() {
        let mut handshake = Handshake::new(HandshakeConfig::default());
        handshake.build_initialize_request(1).unwrap();
        handshake.mark_awaiting().unwrap();

        let negotiated = handshake
            .process_response(JsonRpcResponse::success(1, init_result("2024-11-05")))
            .unwrap();
        assert_eq!(negotiated.protocol_version.as_str(), "2024-11-05");
        assert_eq!(negotiated.server_info.name, "test-server");
        assert_eq!(handshake.state(), &HandshakeState::Negotiated);
    }

    #[test]
    fn test_error_and_missing_result_fail() {
        let mut handshake = Handshake::new(HandshakeConfig::default());
        handshake.build_initialize_request(1).unwrap();
        handshake.mark_awaiting().unwrap();
        let err = handshake
            .process_response(JsonRpcResponse::failure(
                1,
                JsonRpcError::internal_error("boom"),
            ))
            .unwrap_err();
        assert!(matches!(err, MCPError::Protocol(_)));

        let mut handshake = Handshake::new(HandshakeConfig::default());
        handshake.build_initialize_request(1).unwrap();
        handshake.mark_awaiting().unwrap();
        let err = handshake
            .process_response(JsonRpcResponse::success(1, json!(null)))
            .unwrap_err();
        assert!(err.to_string().contains("missing 'result'"));
    }

    #[test]
    fn test_initialized_notification_before_negotiation_is_error() {
        let handshake = Handshake::new(HandshakeConfig::default());
        assert!(matches!(
            handshake.build_initialized_notification(),
            Err(MCPError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_out_of_order_transitions_rejected() {
        let mut handshake = Handshake::new(HandshakeConfig::default());
        assert!(handshake.mark_awaiting().is_err());
        assert!(handshake.mark_initialized().is_err());
        assert_eq!(handshake.state(), &HandshakeState::New);
    }

    #[tokio::test]
    async fn test_perform_with_channel() {
        let mut channel = MockHandshakeChannel::new();
        channel
            .expect_initialize()
            .times(1)
            .returning(|request| Ok(JsonRpcResponse::success(request.id, init_result("2025-03-26"))));
        channel
            .expect_initialized()
            .withf(|n| n.method == "notifications/initialized" && n.params.is_none())
            .times(1)
            .returning(|_| Ok(()));

        let mut handshake = Handshake::new(HandshakeConfig::default());
        let negotiated = handshake.perform(&channel, 1).await.unwrap();

        assert!(handshake.is_initialized());
        assert_eq!(negotiated.protocol_version, ProtocolVersion::latest());

        let mut session = Session::new("client-1", ClientCapabilities::default());
        session.record(&negotiated);
        assert!(session.initialized);
    }

    #[tokio::test]
    async fn test_failed_initialized_notification_leaves_session_uninitialized() {
        let mut channel = MockHandshakeChannel::new();
        channel
            .expect_initialize()
            .returning(|request| Ok(JsonRpcResponse::success(request.id, init_result("2025-03-26"))));
        channel
            .expect_initialized()
            .returning(|_| Err(MCPError::http_status(500, "oops")));

        let mut handshake = Handshake::new(HandshakeConfig::default());
        let err = handshake.perform(&channel, 1).await.unwrap_err();

        assert!(matches!(err, MCPError::HttpStatus { status: 500, .. }));
        assert!(!handshake.is_initialized());
        assert!(matches!(handshake.state(), HandshakeState::Failed(_)));
    }

    #[tokio::test]
    async fn test_unsupported_version_never_sends_initialized() {
        let mut channel = MockHandshakeChannel::new();
        channel
            .expect_initialize()
            .returning(|request| Ok(JsonRpcResponse::success(request.id, init_result("1999-01-01"))));
        channel.expect_initialized().times(0);

        let mut handshake = Handshake::new(HandshakeConfig::default());
        let err = handshake.perform(&channel, 1).await.unwrap_err();
        assert!(matches!(err, MCPError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_config_validation() {
        assert!(HandshakeConfig::default().validate().is_ok());
        let bad = HandshakeConfig {
            supported_versions: vec!["latest".to_string()],
            ..HandshakeConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
