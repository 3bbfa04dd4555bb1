//! Configuration loading and persistence tests
//!
//! Tests focus on BEHAVIOR of the TOML store: defaults for missing keys,
//! credential resolution, the subscription QoS rule and write-through from
//! a running session manager.

use mqtt_session::config::{ConfigError, ConfigStore, FileConfigStore, StoredSettings};
use mqtt_session::session::{QoS, Session, SessionManager, Subscription};
use mqtt_session::testing::MockTransport;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
auto_start = true
broadcast = true

[session]
client_id = "sensor-17"
server_uri = "mqtt://broker.local:1883"
fallback_uris = ["mqtts://backup.example.com:8883"]
username = "device"
password = "pw"
clean_session = true
keep_alive_secs = 30
connection_timeout_secs = 5

[subscriptions]
topics = ["a/b", "sensors/#"]
qos = [1, 2]
"#
    )
    .unwrap();

    let settings = StoredSettings::load_from_file(temp_file.path()).unwrap();
    let session = settings.session().unwrap().expect("session configured");

    assert!(settings.auto_start);
    assert!(settings.broadcast);
    assert_eq!(session.client_id, "sensor-17");
    assert_eq!(session.server_uri, "mqtt://broker.local:1883");
    assert_eq!(session.fallback_uris, vec!["mqtts://backup.example.com:8883"]);
    assert!(session.clean_session);
    assert_eq!(session.keep_alive, Duration::from_secs(30));
    assert_eq!(session.connection_timeout, Duration::from_secs(5));
    let credentials = session.credentials.expect("credentials");
    assert_eq!(credentials.username, "device");
    assert_eq!(credentials.password, "pw");

    assert_eq!(
        settings.subscriptions(),
        vec![
            Subscription::new("a/b", QoS::AtLeastOnce),
            Subscription::new("sensors/#", QoS::ExactlyOnce),
        ]
    );
}

#[test]
fn test_empty_file_uses_defaults() {
    let temp_file = NamedTempFile::new().unwrap();
    let settings = StoredSettings::load_from_file(temp_file.path()).unwrap();

    assert_eq!(settings, StoredSettings::default());
    assert!(!settings.auto_start);
    assert!(!settings.broadcast);
    assert_eq!(settings.session.keep_alive_secs, 60);
    assert_eq!(settings.session.connection_timeout_secs, 15);
    assert!(settings.session().unwrap().is_none());
    assert!(settings.subscriptions().is_empty());
}

#[test]
fn test_missing_server_uri_means_unconfigured() {
    let settings = StoredSettings::from_toml_str("[session]\nclient_id = \"only-id\"\n").unwrap();
    assert!(settings.session().unwrap().is_none());
}

#[test]
fn test_mismatched_qos_list_defaults_every_topic_to_qos0() {
    let settings = StoredSettings::from_toml_str(
        r#"
[subscriptions]
topics = ["a", "b", "c"]
qos = [1, 2]
"#,
    )
    .unwrap();

    let subscriptions = settings.subscriptions();
    assert_eq!(subscriptions.len(), 3);
    assert!(subscriptions.iter().all(|s| s.qos == QoS::AtMostOnce));
}

#[test]
fn test_invalid_client_id_is_rejected() {
    let settings = StoredSettings::from_toml_str(
        r#"
[session]
client_id = "has spaces!"
server_uri = "mqtt://localhost:1883"
"#,
    )
    .unwrap();

    assert!(matches!(
        settings.session(),
        Err(ConfigError::InvalidClientId(_))
    ));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[session\nclient_id = ").unwrap();

    assert!(matches!(
        StoredSettings::load_from_file(temp_file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_credentials_resolve_from_environment() {
    std::env::set_var("MQTT_SESSION_TEST_USER", "env-user");
    std::env::set_var("MQTT_SESSION_TEST_PASS", "env-pass");

    let settings = StoredSettings::from_toml_str(
        r#"
[session]
client_id = "env-client"
server_uri = "mqtt://localhost:1883"
username_env = "MQTT_SESSION_TEST_USER"
password_env = "MQTT_SESSION_TEST_PASS"
"#,
    )
    .unwrap();

    let session = settings.session().unwrap().unwrap();
    let credentials = session.credentials.clone().unwrap();
    assert_eq!(credentials.username, "env-user");
    assert_eq!(credentials.password, "env-pass");

    // Saving the same session back keeps the secret out of the file
    let mut saved = settings.clone();
    saved.set_session(&session);
    let rendered = saved.to_toml_string().unwrap();
    assert!(!rendered.contains("env-pass"));
    assert!(rendered.contains("MQTT_SESSION_TEST_PASS"));
}

#[test]
fn test_file_store_missing_file_loads_defaults_and_saves() {
    let dir = TempDir::new().unwrap();
    let store = FileConfigStore::new(dir.path().join("nested/mqtt-session.toml"));

    assert_eq!(store.load().unwrap(), StoredSettings::default());

    let mut settings = StoredSettings::default();
    settings.set_session(&Session::new("saved", "mqtt://localhost:1883"));
    settings.set_subscriptions(&[Subscription::new("x/y", QoS::AtLeastOnce)]);
    store.save(&settings).unwrap();

    let reloaded = store.load().unwrap();
    assert_eq!(reloaded, settings);
    assert_eq!(reloaded.session().unwrap().unwrap().client_id, "saved");
}

#[tokio::test]
async fn test_manager_restores_from_and_writes_through_to_file_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mqtt-session.toml");
    std::fs::write(
        &path,
        r#"
broadcast = true

[session]
client_id = "restored"
server_uri = "mqtt://localhost:1883"

[subscriptions]
topics = ["restored/topic"]
qos = [1]
"#,
    )
    .unwrap();

    let store = Arc::new(FileConfigStore::new(&path));
    let manager = SessionManager::from_store(Arc::new(MockTransport::new()), store.clone())
        .unwrap()
        .build();

    assert_eq!(manager.session().unwrap().client_id, "restored");
    assert!(manager.broadcast_enabled());
    assert_eq!(
        manager.subscriptions(),
        vec![Subscription::new("restored/topic", QoS::AtLeastOnce)]
    );

    manager.subscribe("added/topic", QoS::ExactlyOnce).await.unwrap();
    manager.set_auto_start(true);

    let on_disk = store.load().unwrap();
    assert!(on_disk.auto_start);
    assert_eq!(on_disk.subscriptions.topics, vec!["restored/topic", "added/topic"]);
    assert_eq!(on_disk.subscriptions.qos, vec![1, 2]);
    assert_eq!(on_disk.session.client_id.as_deref(), Some("restored"));
}
