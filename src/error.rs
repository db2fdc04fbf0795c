//! Crate-level error handling
//!
//! [`AppError`] covers the layer around the session engine: configuration
//! loading, file IO and logging setup. Protocol and transport failures stay
//! in [`MCPError`] and are wrapped when they cross into this layer.

use thiserror::Error;

use crate::mcp::errors::{ErrorSeverity, MCPError};

/// Application result type alias
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Main application error enum
#[derive(Error, Debug)]
pub enum AppError {
    /// Session engine errors
    #[error("MCP error: {0}")]
    Mcp(#[from] MCPError),

    /// I/O operation errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Layered configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration file parse errors
    #[error("Failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration file write errors
    #[error("Failed to serialize config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Invalid configuration values
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl AppError {
    /// Create a new invalid-configuration error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Mcp(e) => e.is_retryable(),
            AppError::Io(_) => false,
            AppError::Config(_) => false,
            AppError::Toml(_) => false,
            AppError::TomlSerialize(_) => false,
            AppError::Serde(_) => false,
            AppError::InvalidConfig { .. } => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AppError::Mcp(e) => e.severity(),
            AppError::Io(_) => ErrorSeverity::High,
            AppError::Config(_) | AppError::Toml(_) | AppError::InvalidConfig { .. } => {
                ErrorSeverity::High
            }
            AppError::TomlSerialize(_) | AppError::Serde(_) => ErrorSeverity::Medium,
        }
    }
}
