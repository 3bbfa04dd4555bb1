//! Tests for logging configuration and format parsing
//!
//! Exercises the public logging entry points the binary relies on.

use mqtt_session::observability::logging::{build_filter, parse_level, LogFormat};
use mqtt_session::observability::init_logging;
use tracing::Level;

#[test]
fn test_log_format_parse_whitespace() {
    assert_eq!(LogFormat::parse("  json  "), LogFormat::Json);
    assert_eq!(LogFormat::parse("pretty\n"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("\tcompact"), LogFormat::Compact);
}

#[test]
fn test_log_format_unknown_defaults_to_json() {
    assert_eq!(LogFormat::parse("logfmt"), LogFormat::Json);
    assert_eq!(LogFormat::parse("123"), LogFormat::Json);
}

#[test]
fn test_log_level_parse_trims_and_defaults() {
    assert_eq!(parse_level(" debug "), Level::DEBUG);
    assert_eq!(parse_level("verbose"), Level::INFO);
    assert_eq!(parse_level(""), Level::INFO);
}

#[test]
fn test_filter_quiets_mqtt_library_at_any_level() {
    let rendered = build_filter(Level::TRACE).to_string();
    assert!(rendered.contains("rumqttc=warn"));
}

#[test]
fn test_logging_can_be_initialized_repeatedly() {
    for format in [LogFormat::Json, LogFormat::Pretty, LogFormat::Compact] {
        init_logging(Level::INFO, format, false);
    }
    tracing::info!(client_id = "logging-test", "log line after init");
}
