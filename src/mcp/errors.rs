//! MCP Session Error Handling
//!
//! Error taxonomy for the session engine:
//! - Transport: connection refused, bad HTTP status, stream read failure
//! - Protocol: malformed envelope, version mismatch, missing result
//! - Validation: schema violations and hidden-content detections
//! - Cancellation: caller-initiated aborts, timeouts and session close

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::protocol::JsonRpcError;
use super::tools::HiddenContentFinding;

/// Result type for MCP operations
pub type MCPResult<T> = Result<T, MCPError>;

/// MCP session error enumeration
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MCPError {
    /// Error object returned by the peer
    #[error("Protocol error: {0}")]
    Protocol(JsonRpcError),

    /// Transport-level errors (stream read failures, broken pipes)
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Connection could not be established
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Synchronous submission answered with an unexpected status
    #[error("Unexpected HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Envelope did not have a valid JSON-RPC shape
    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    /// Timeout errors
    #[error("Timeout error: operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Session closed while the operation was in flight
    #[error("Session closed")]
    Closed,

    /// Traffic attempted before the handshake completed
    #[error("Session not initialized")]
    NotInitialized,

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Server chose a protocol version outside the supported set
    #[error("unsupported protocol version '{version}' from server (supported: {})", supported.join(", "))]
    UnsupportedVersion {
        version: String,
        supported: Vec<String>,
    },

    /// Endpoint event pointed at a different origin than the stream
    #[error("Endpoint origin mismatch: expected {expected}, got {actual}")]
    EndpointMismatch { expected: String, actual: String },

    /// Inbound notification method without a handler
    #[error("unsupported notification method: {method}")]
    UnsupportedNotification { method: String },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Tool missing from the registry
    #[error("tool '{name}' not found or not permitted")]
    ToolNotFound { name: String },

    /// Invisible or direction-altering characters found in untrusted text
    #[error("Hidden content detected: {} suspicious character(s)", findings.len())]
    HiddenContent { findings: Vec<HiddenContentFinding> },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl MCPError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create an HTTP status error
    pub fn http_status(status: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            body: body.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an invalid message error
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an unsupported version error
    pub fn unsupported_version(version: impl Into<String>, supported: &[String]) -> Self {
        Self::UnsupportedVersion {
            version: version.into(),
            supported: supported.to_vec(),
        }
    }

    /// Create an endpoint mismatch error
    pub fn endpoint_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::EndpointMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an unsupported notification error
    pub fn unsupported_notification(method: impl Into<String>) -> Self {
        Self::UnsupportedNotification {
            method: method.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a tool not found error
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound { name: name.into() }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error object
    pub fn to_protocol_error(&self) -> JsonRpcError {
        match self {
            MCPError::Protocol(err) => err.clone(),
            MCPError::Serialization { message } => JsonRpcError::parse_error(message),
            MCPError::InvalidMessage { message } => JsonRpcError::invalid_request(message),
            MCPError::UnsupportedNotification { method } => JsonRpcError::method_not_found(method),
            MCPError::ToolNotFound { name } => {
                JsonRpcError::method_not_found(format!("Tool '{}'", name))
            }
            MCPError::Validation { .. } | MCPError::HiddenContent { .. } => {
                JsonRpcError::invalid_params(self.to_string())
            }
            MCPError::UnsupportedVersion { .. } | MCPError::NotInitialized => {
                JsonRpcError::invalid_request(self.to_string())
            }
            other => JsonRpcError::internal_error(other.to_string()),
        }
    }

    /// Get error category for logging and statistics
    pub fn category(&self) -> ErrorCategory {
        match self {
            MCPError::Transport { .. }
            | MCPError::Connection { .. }
            | MCPError::HttpStatus { .. }
            | MCPError::EndpointMismatch { .. } => ErrorCategory::Transport,
            MCPError::Protocol(_)
            | MCPError::Serialization { .. }
            | MCPError::InvalidMessage { .. }
            | MCPError::NotInitialized
            | MCPError::InvalidState { .. }
            | MCPError::UnsupportedVersion { .. }
            | MCPError::UnsupportedNotification { .. } => ErrorCategory::Protocol,
            MCPError::Validation { .. }
            | MCPError::ToolNotFound { .. }
            | MCPError::HiddenContent { .. } => ErrorCategory::Validation,
            MCPError::Timeout { .. } | MCPError::Cancelled | MCPError::Closed => {
                ErrorCategory::Cancellation
            }
            MCPError::Configuration { .. } => ErrorCategory::Configuration,
        }
    }

    /// Check if the error is retryable at session-start granularity
    pub fn is_retryable(&self) -> bool {
        match self {
            MCPError::Transport { .. } | MCPError::Connection { .. } => true,
            MCPError::Timeout { .. } => true,
            MCPError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the error was caused by cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, MCPError::Cancelled | MCPError::Closed)
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            MCPError::EndpointMismatch { .. } | MCPError::HiddenContent { .. } => {
                ErrorSeverity::Critical
            }
            MCPError::UnsupportedVersion { .. } | MCPError::Configuration { .. } => {
                ErrorSeverity::High
            }
            MCPError::Validation { .. }
            | MCPError::ToolNotFound { .. }
            | MCPError::UnsupportedNotification { .. }
            | MCPError::Cancelled => ErrorSeverity::Low,
            _ => ErrorSeverity::Medium,
        }
    }
}

/// Error category for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Validation,
    Cancellation,
    Configuration,
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<serde_json::Error> for MCPError {
    fn from(err: serde_json::Error) -> Self {
        MCPError::serialization(err.to_string())
    }
}

impl From<url::ParseError> for MCPError {
    fn from(err: url::ParseError) -> Self {
        MCPError::configuration(format!("Invalid URL: {}", err))
    }
}

impl From<reqwest::Error> for MCPError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured duration
            MCPError::transport(format!("Request timed out: {}", err))
        } else if err.is_connect() {
            MCPError::connection(err.to_string())
        } else if err.is_decode() {
            MCPError::serialization(err.to_string())
        } else {
            MCPError::transport(err.to_string())
        }
    }
}

impl From<std::io::Error> for MCPError {
    fn from(err: std::io::Error) -> Self {
        MCPError::transport(err.to_string())
    }
}
