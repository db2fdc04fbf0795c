//! MCP Session - client-side Model Context Protocol session engine
//!
//! This library connects an agent to an MCP server and keeps the session
//! healthy while requests, notifications and tool calls flow over it.
//!
//! # Architecture
//!
//! - **Transport Layer**: event-stream, direct HTTP and stdio bindings
//! - **Session Layer**: handshake, version negotiation, request correlation
//! - **Domain Layer**: conversation context memory, tool-call validation
//! - **Infrastructure Layer**: configuration files, environment overrides, logging

pub mod config;
pub mod error;
pub mod mcp;

pub use config::{Config, LoggingSettings, SessionSettings};
pub use error::{AppError, AppResult};
pub use mcp::{McpClient, McpClientConfig, MCPError, MCPResult};

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the logging system with structured logging
///
/// `RUST_LOG` wins over `settings.filter` when set. Calling this twice is
/// harmless; the second subscriber is ignored.
pub fn initialize_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::try_new(&settings.filter)?,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(settings.ansi)
                .with_target(settings.with_target),
        )
        .try_init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_logging_twice() {
        let settings = LoggingSettings::default();
        assert!(initialize_logging(&settings).is_ok());
        assert!(initialize_logging(&settings).is_ok());
    }
}
