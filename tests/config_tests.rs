//! Configuration tests
//!
//! Layered loading and the path from a configuration file to a client.

use mcp_session::{
    mcp::{HiddenContentPolicy, MCPError, McpClient, TransportType},
    AppError, Config,
};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[test]
fn test_environment_overrides_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mcp-session.toml");
    std::fs::write(
        &path,
        r#"
[session]
transport = "http"
endpoint = "https://tools.example.com/mcp"
request_timeout_secs = 12
max_stream_reopens = 1

[session.headers]
authorization = "Bearer file-token"

[logging]
filter = "mcp_session=debug"
"#,
    )
    .unwrap();

    // Only test in this binary that reads the environment
    std::env::set_var("MCP_SESSION__SESSION__MAX_STREAM_REOPENS", "4");
    std::env::set_var("MCP_SESSION__SESSION__HIDDEN_CONTENT_POLICY", "warn");
    let config = Config::load_layered(Some(&path));
    std::env::remove_var("MCP_SESSION__SESSION__MAX_STREAM_REOPENS");
    std::env::remove_var("MCP_SESSION__SESSION__HIDDEN_CONTENT_POLICY");

    let config = config.unwrap();
    assert_eq!(config.session.transport, TransportType::Http);
    assert_eq!(config.session.request_timeout_secs, 12);
    assert_eq!(config.session.max_stream_reopens, 4);
    assert_eq!(
        config.session.hidden_content_policy,
        HiddenContentPolicy::Warn
    );
    assert_eq!(config.logging.filter, "mcp_session=debug");

    let client_config = config.to_client_config().unwrap();
    assert_eq!(client_config.transport.request_timeout, Duration::from_secs(12));
    assert_eq!(
        client_config.transport.headers.get("authorization").unwrap(),
        "Bearer file-token"
    );
}

#[tokio::test]
async fn test_saved_config_builds_a_client() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    let mut config = Config::default();
    config.session.transport = TransportType::Stdio;
    config.session.endpoint = "mcp-session-test-binary-that-does-not-exist --stdio".into();
    config.session.client_id = Some("agent-42".into());
    config.save_to_file(&path).await.unwrap();

    let loaded = Config::load_from_file(&path).await.unwrap();
    let client = McpClient::new(loaded.to_client_config().unwrap()).unwrap();
    assert_eq!(client.identity(), "agent-42");

    let err = client.connect(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, MCPError::Connection { .. }));
    assert!(!client.is_ready());
}

#[tokio::test]
async fn test_missing_file_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let err = Config::load_from_file(dir.path().join("absent.toml"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Io(_)));
    assert!(!err.is_recoverable());
}
