//! Configuration management module
//!
//! Provides configuration loading with:
//! - TOML-based configuration files
//! - Layered file + `MCP_SESSION__*` environment overrides
//! - Validation and conversion into [`McpClientConfig`]

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::{debug, info};

use crate::{
    error::{AppError, AppResult},
    mcp::{
        client::McpClientConfig,
        handshake::HandshakeConfig,
        protocol::{Implementation, SUPPORTED_PROTOCOL_VERSIONS},
        tools::HiddenContentPolicy,
        transport::{TransportConfig, TransportType},
    },
};

/// File name searched in the working directory
pub const CONFIG_FILE_NAME: &str = "mcp-session.toml";
/// Prefix of environment overrides, e.g. `MCP_SESSION__SESSION__ENDPOINT`
pub const ENV_PREFIX: &str = "MCP_SESSION";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session and transport settings
    pub session: SessionSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

/// Session settings, flattened to plain numbers for file and env friendliness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub transport: TransportType,
    /// Stream URL, direct endpoint URL, or command line for stdio
    pub endpoint: String,
    pub init_endpoint: Option<String>,
    /// Fixed client identity; a random one is generated when absent
    pub client_id: Option<String>,
    pub request_timeout_secs: u64,
    pub endpoint_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_stream_reopens: u32,
    pub max_message_size: usize,
    /// Extra headers on every submission
    pub headers: HashMap<String, String>,
    pub supported_versions: Vec<String>,
    pub client_name: String,
    pub client_version: String,
    pub hidden_content_policy: HiddenContentPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let transport = TransportConfig::default();
        let handshake = HandshakeConfig::default();
        Self {
            transport: transport.transport_type,
            endpoint: transport.endpoint,
            init_endpoint: None,
            client_id: None,
            request_timeout_secs: transport.request_timeout.as_secs(),
            endpoint_timeout_secs: transport.endpoint_timeout.as_secs(),
            connect_timeout_secs: transport.connect_timeout.as_secs(),
            max_reconnect_attempts: transport.max_reconnect_attempts,
            reconnect_delay_ms: transport.reconnect_delay.as_millis() as u64,
            max_stream_reopens: transport.max_stream_reopens,
            max_message_size: transport.max_message_size,
            headers: HashMap::new(),
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            client_name: handshake.client_info.name,
            client_version: handshake.client_info.version,
            hidden_content_policy: HiddenContentPolicy::default(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set
    pub filter: String,
    /// Colored output
    pub ansi: bool,
    /// Include the event target
    pub with_target: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "mcp_session=info".to_string(),
            ansi: true,
            with_target: true,
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./mcp-session.toml
    /// 2. ~/.config/mcp-session/config.toml
    /// 3. Default configuration
    pub async fn load() -> AppResult<Self> {
        info!("Loading session configuration");

        if let Ok(config) = Self::load_from_file(CONFIG_FILE_NAME).await {
            info!("Loaded configuration from ./{}", CONFIG_FILE_NAME);
            return Ok(config);
        }

        if let Some(config_path) = Self::user_config_path() {
            if let Ok(config) = Self::load_from_file(&config_path).await {
                info!("Loaded configuration from {}", config_path.display());
                return Ok(config);
            }
        }

        info!("Using default configuration");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then `file` if present, then `MCP_SESSION__*` environment
    /// variables (`__` separates nested keys)
    pub fn load_layered(file: Option<&Path>) -> AppResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = file {
            debug!("Layering configuration file: {}", path.display());
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> AppResult<()> {
        debug!("Validating configuration");
        let session = &self.session;

        if session.endpoint.trim().is_empty() {
            return Err(AppError::invalid_config("endpoint must not be empty"));
        }
        if session.request_timeout_secs == 0 || session.endpoint_timeout_secs == 0 {
            return Err(AppError::invalid_config(
                "request_timeout_secs and endpoint_timeout_secs must be greater than 0",
            ));
        }
        if session.max_message_size == 0 {
            return Err(AppError::invalid_config(
                "max_message_size must be greater than 0",
            ));
        }
        if session.supported_versions.is_empty() {
            return Err(AppError::invalid_config(
                "supported_versions must list at least one version",
            ));
        }
        if self.logging.filter.trim().is_empty() {
            return Err(AppError::invalid_config("logging filter must not be empty"));
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Typed client configuration; rejects values the transport or
    /// handshake would refuse
    pub fn to_client_config(&self) -> AppResult<McpClientConfig> {
        self.validate()?;
        let session = &self.session;

        let defaults = TransportConfig::default();
        let transport = TransportConfig {
            transport_type: session.transport,
            endpoint: session.endpoint.clone(),
            init_endpoint: session.init_endpoint.clone(),
            client_id: session.client_id.clone().unwrap_or(defaults.client_id),
            request_timeout: Duration::from_secs(session.request_timeout_secs),
            endpoint_timeout: Duration::from_secs(session.endpoint_timeout_secs),
            connect_timeout: Duration::from_secs(session.connect_timeout_secs),
            max_reconnect_attempts: session.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(session.reconnect_delay_ms),
            max_stream_reopens: session.max_stream_reopens,
            max_message_size: session.max_message_size,
            headers: session.headers.clone(),
        };
        transport.validate()?;

        let handshake = HandshakeConfig {
            supported_versions: session.supported_versions.clone(),
            client_info: Implementation::new(&session.client_name, &session.client_version),
            ..HandshakeConfig::default()
        };
        handshake.validate()?;

        Ok(McpClientConfig {
            transport,
            handshake,
            hidden_content_policy: session.hidden_content_policy,
        })
    }

    /// User configuration file path
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push("mcp-session");
            path.push("config.toml");
            path
        })
    }
}
