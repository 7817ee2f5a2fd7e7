//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use peer_transport::config::{
    ClientConfig, FramingConfig, LoggingConfig, ServerConfig, TransportConfig, MAX_FRAME_SIZE,
};
use peer_transport::error::TransportError;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = TransportConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_zero_event_capacity() {
    let mut config = TransportConfig::default();
    config.server.event_capacity = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Event capacity must be greater than 0")));
}

#[test]
fn test_excessive_event_capacity() {
    let mut config = TransportConfig::default();
    config.server.event_capacity = 2_000_000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Event capacity too large")));
}

#[test]
fn test_negative_duplicate_threshold_is_valid() {
    let mut config = TransportConfig::default();
    config.server.max_duplicate_addresses = -1;
    assert!(config.validate().is_empty());
}

#[test]
fn test_huge_duplicate_threshold() {
    let server = ServerConfig {
        max_duplicate_addresses: 1_000_000,
        ..ServerConfig::default()
    };
    assert!(server
        .validate()
        .iter()
        .any(|e| e.contains("Max duplicate addresses very high")));
}

#[test]
fn test_short_connect_timeout() {
    let mut config = TransportConfig::default();
    config.client.connect_timeout = Duration::from_millis(5);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Connect timeout too short")));
}

#[test]
fn test_long_connect_timeout() {
    let client = ClientConfig {
        connect_timeout: Duration::from_secs(301),
        ..ClientConfig::default()
    };
    assert!(client
        .validate()
        .iter()
        .any(|e| e.contains("Connect timeout too long")));
}

#[test]
fn test_client_datagram_port_zero() {
    let client = ClientConfig {
        datagram_port: Some(0),
        ..ClientConfig::default()
    };
    assert!(client
        .validate()
        .iter()
        .any(|e| e.contains("Client datagram port")));
}

#[test]
fn test_frame_size_limits() {
    let zero = FramingConfig {
        max_frame_size: 0,
        ..FramingConfig::default()
    };
    assert!(zero.validate().iter().any(|e| e.contains("cannot be 0")));

    let too_big = FramingConfig {
        max_frame_size: MAX_FRAME_SIZE + 1,
        ..FramingConfig::default()
    };
    assert!(too_big
        .validate()
        .iter()
        .any(|e| e.contains("Max frame size too large")));

    let at_limit = FramingConfig {
        max_frame_size: MAX_FRAME_SIZE,
        ..FramingConfig::default()
    };
    assert!(at_limit.validate().is_empty());
}

#[test]
fn test_datagram_size_limits() {
    let small = FramingConfig {
        max_datagram_size: 3,
        ..FramingConfig::default()
    };
    assert!(small
        .validate()
        .iter()
        .any(|e| e.contains("Max datagram size too small")));

    let big = FramingConfig {
        max_datagram_size: 1025,
        ..FramingConfig::default()
    };
    assert!(big
        .validate()
        .iter()
        .any(|e| e.contains("Max datagram size too large")));
}

#[test]
fn test_logging_needs_an_output() {
    let logging = LoggingConfig {
        log_to_console: false,
        log_to_file: false,
        ..LoggingConfig::default()
    };
    assert!(logging
        .validate()
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_logging_file_without_path() {
    let logging = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };
    assert!(logging
        .validate()
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_validate_strict_collects_everything() {
    let mut config = TransportConfig::default();
    config.server.event_capacity = 0;
    config.framing.max_frame_size = 0;

    match config.validate_strict() {
        Err(TransportError::ConfigError(msg)) => {
            assert!(msg.contains("Event capacity"));
            assert!(msg.contains("Max frame size"));
        }
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn test_partial_toml_fills_defaults() {
    let config = TransportConfig::from_toml(
        r#"
        [server]
        tcp_port = 9000
        udp_port = 9001
        allow_remote = true
        max_duplicate_addresses = 3
        event_capacity = 64

        [logging]
        app_name = "arena"
        log_level = "debug"
        log_to_console = true
        log_to_file = false
        json_format = true
        "#,
    )
    .expect("parse");

    assert_eq!(config.server.tcp_port, 9000);
    assert_eq!(config.server.max_duplicate_addresses, 3);
    assert!(config.server.allow_remote);
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert_eq!(config.framing.max_frame_size, MAX_FRAME_SIZE);
    assert_eq!(config.client.datagram_port, None);
    assert!(config.validate().is_empty());
}

#[test]
fn test_bad_log_level_rejected() {
    let result = TransportConfig::from_toml(
        r#"
        [logging]
        app_name = "arena"
        log_level = "loud"
        log_to_console = true
        log_to_file = false
        json_format = false
        "#,
    );
    assert!(matches!(result, Err(TransportError::ConfigError(_))));
}

#[test]
fn test_example_config_parses_back() {
    let example = TransportConfig::example_config();
    let parsed = TransportConfig::from_toml(&example).expect("example parses");
    assert_eq!(parsed.server.tcp_port, ServerConfig::default().tcp_port);
    assert_eq!(
        parsed.client.connect_timeout,
        ClientConfig::default().connect_timeout
    );
}

#[test]
fn test_save_and_load_file() {
    let path = std::env::temp_dir().join(format!(
        "peer-transport-config-{}.toml",
        std::process::id()
    ));
    let config = TransportConfig::default_with_overrides(|c| {
        c.server.udp_port = 9911;
        c.client.connect_timeout = Duration::from_millis(750);
    });
    config.save_to_file(&path).expect("save");

    let loaded = TransportConfig::from_file(&path).expect("load");
    assert_eq!(loaded.server.udp_port, 9911);
    assert_eq!(loaded.client.connect_timeout, Duration::from_millis(750));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_missing_file_is_config_error() {
    let result = TransportConfig::from_file("/nonexistent/peer-transport.toml");
    assert!(matches!(result, Err(TransportError::ConfigError(_))));
}

#[test]
#[serial_test::serial]
fn test_from_env_overrides() {
    std::env::set_var("PEER_TRANSPORT_TCP_PORT", "9200");
    std::env::set_var("PEER_TRANSPORT_MAX_DUPLICATE_ADDRESSES", "2");
    std::env::set_var("PEER_TRANSPORT_CLIENT_DATAGRAM_PORT", "9201");
    let config = TransportConfig::from_env();
    std::env::remove_var("PEER_TRANSPORT_TCP_PORT");
    std::env::remove_var("PEER_TRANSPORT_MAX_DUPLICATE_ADDRESSES");
    std::env::remove_var("PEER_TRANSPORT_CLIENT_DATAGRAM_PORT");

    let config = config.expect("env config");
    assert_eq!(config.server.tcp_port, 9200);
    assert_eq!(config.server.max_duplicate_addresses, 2);
    assert_eq!(config.client.datagram_port, Some(9201));
    assert_eq!(config.server.udp_port, ServerConfig::default().udp_port);
}

#[test]
#[serial_test::serial]
fn test_from_env_rejects_garbage() {
    std::env::set_var("PEER_TRANSPORT_UDP_PORT", "not-a-port");
    let result = TransportConfig::from_env();
    std::env::remove_var("PEER_TRANSPORT_UDP_PORT");
    assert!(matches!(result, Err(TransportError::ConfigError(_))));
}
