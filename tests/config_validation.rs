//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use mog_session::config::{
    ClientConfig, LoggingConfig, NetworkConfig, ServerConfig, TransportConfig,
};
use mog_session::ProtocolError;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_zero_max_connections() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;

    let errors = config.validate();
    assert!(!errors.is_empty());
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_high_max_connections_warning() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 200_000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max connections very high")));
}

#[test]
fn test_short_server_handshake_timeout() {
    let mut config = NetworkConfig::default();
    config.server.handshake_timeout = Some(Duration::from_millis(50));

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Server handshake timeout too short")));
}

#[test]
fn test_long_server_handshake_timeout() {
    let mut config = NetworkConfig::default();
    config.server.handshake_timeout = Some(Duration::from_secs(600));

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Server handshake timeout too long")));
}

#[test]
fn test_disabled_timeouts_are_valid() {
    let mut config = NetworkConfig::default();
    config.server.handshake_timeout = None;
    config.client.connect_timeout = None;
    config.client.handshake_timeout = None;

    assert!(config.validate().is_empty());
}

#[test]
fn test_short_connect_timeout() {
    let mut config = NetworkConfig::default();
    config.client.connect_timeout = Some(Duration::from_millis(10));

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Connect timeout too short")));
}

#[test]
fn test_short_client_handshake_timeout() {
    let mut config = NetworkConfig::default();
    config.client.handshake_timeout = Some(Duration::from_millis(10));

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Client handshake timeout too short")));
}

#[test]
fn test_long_logout_drain_timeout() {
    let mut config = NetworkConfig::default();
    config.server.logout_drain_timeout = Duration::from_secs(120);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Logout drain timeout too long")));
}

#[test]
fn test_zero_max_payload_size() {
    let mut config = NetworkConfig::default();
    config.transport.max_payload_size = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max payload size cannot be 0")));
}

#[test]
fn test_excessive_max_payload_size() {
    let mut config = NetworkConfig::default();
    config.transport.max_payload_size = 70_000;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max payload size too large")));
}

#[test]
fn test_tiny_read_buffer() {
    let mut config = NetworkConfig::default();
    config.transport.read_buffer_capacity = 16;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Read buffer capacity too small")));
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_long_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = "a".repeat(100);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name too long")));
}

#[test]
fn test_validate_strict_with_valid_config() {
    let config = NetworkConfig::default();
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;

    match config.validate_strict() {
        Err(ProtocolError::ConfigError(msg)) => {
            assert!(msg.contains("Configuration validation failed"));
            assert!(msg.contains("Max connections"));
        }
        other => panic!("Expected ConfigError, got {:?}", other),
    }
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;
    config.transport.max_payload_size = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 3,
        "Should have at least 3 errors, got: {:?}",
        errors
    );
}

#[test]
fn test_valid_production_config() {
    let config = NetworkConfig {
        server: ServerConfig {
            address: Ipv4Addr::UNSPECIFIED,
            port: 27015,
            enable_ipv6: true,
            max_connections: 5000,
            handshake_timeout: Some(Duration::from_secs(15)),
            logout_drain_timeout: Duration::from_secs(1),
        },
        client: ClientConfig {
            connect_timeout: Some(Duration::from_secs(5)),
            handshake_timeout: Some(Duration::from_secs(15)),
            logout_drain_timeout: Duration::from_secs(1),
            nodelay: true,
        },
        transport: TransportConfig {
            read_buffer_capacity: 16 * 1024,
            max_payload_size: 32 * 1024,
        },
        logging: LoggingConfig {
            app_name: "realm-server".to_string(),
            log_level: Level::WARN,
            json_format: true,
        },
    };

    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Production config should be valid, but got: {:?}",
        errors
    );
}

#[test]
fn test_toml_file_round_trip() {
    let path = std::env::temp_dir().join(format!("mog-session-{}.toml", std::process::id()));
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.port = 4000;
        c.client.handshake_timeout = None;
    });
    config.save_to_file(&path).expect("save config");

    let loaded = NetworkConfig::from_file(&path).expect("load config");
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded.server.port, 4000);
    assert_eq!(loaded.client.handshake_timeout, None);
    assert_eq!(loaded.client.connect_timeout, config.client.connect_timeout);
}

#[test]
fn test_partial_toml_uses_defaults() {
    let config = NetworkConfig::from_toml(
        r#"
        [server]
        address = "127.0.0.1"
        port = 9000
        enable_ipv6 = false
        max_connections = 10
        logout_drain_timeout = 500
        "#,
    )
    .expect("parse partial config");

    assert_eq!(config.server.address, Ipv4Addr::LOCALHOST);
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.server.handshake_timeout, None);
    assert_eq!(config.server.logout_drain_timeout, Duration::from_millis(500));
    assert_eq!(config.transport.max_payload_size, 65535);
}

#[test]
fn test_missing_file_is_config_error() {
    let result = NetworkConfig::from_file("/nonexistent/mog-session.toml");
    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
}
