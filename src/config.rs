//! Persisted session configuration
//!
//! Settings live in a TOML document. Every key is optional: a missing file,
//! table or key reads as unset/empty and falls back to the defaults below.
//!
//! ```toml
//! auto_start = true
//! broadcast = false
//!
//! [session]
//! client_id = "sensor-17"
//! server_uri = "mqtt://broker.local:1883"
//! fallback_uris = ["mqtts://backup.example.com:8883"]
//! username_env = "MQTT_USERNAME"
//! password_env = "MQTT_PASSWORD"
//! clean_session = false
//! keep_alive_secs = 60
//!
//! [subscriptions]
//! topics = ["a/b", "sensors/#"]
//! qos = [1, 0]
//! ```

use crate::session::model::{
    Session, Subscription, DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_KEEP_ALIVE_SECS,
};
use crate::session::subscriptions::SubscriptionManager;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Places the CLI looks for a settings file when none is given
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["mqtt-session.toml", "config/mqtt-session.toml"];

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid client ID format: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Everything the session persists between runs
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoredSettings {
    /// Connect as soon as the process starts
    pub auto_start: bool,
    /// Forward every inbound message to listeners
    pub broadcast: bool,
    pub session: SessionSection,
    pub subscriptions: SubscriptionsSection,
}

/// `[session]` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_uri: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fallback_uris: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Environment variable holding the username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    /// Environment variable holding the password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    pub connection_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            client_id: None,
            server_uri: None,
            fallback_uris: Vec::new(),
            username: None,
            password: None,
            username_env: None,
            password_env: None,
            clean_session: false,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
        }
    }
}

/// `[subscriptions]` table, persisted as parallel lists
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubscriptionsSection {
    pub topics: Vec<String>,
    pub qos: Vec<u8>,
}

impl StoredSettings {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load settings from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Build the session, or `None` while client id or server URI is unset
    pub fn session(&self) -> Result<Option<Session>, ConfigError> {
        let section = &self.session;
        let (Some(client_id), Some(server_uri)) = (
            non_empty(section.client_id.as_deref()),
            non_empty(section.server_uri.as_deref()),
        ) else {
            return Ok(None);
        };

        validate_client_id(client_id)?;
        if section.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be greater than zero".to_string(),
            ));
        }

        let mut session = Session::new(client_id, server_uri)
            .with_fallback_uris(
                section
                    .fallback_uris
                    .iter()
                    .filter(|uri| !uri.trim().is_empty())
                    .cloned()
                    .collect(),
            )
            .with_clean_session(section.clean_session)
            .with_keep_alive(Duration::from_secs(section.keep_alive_secs));
        session.connection_timeout = Duration::from_secs(section.connection_timeout_secs.max(1));

        if let Some(username) = self.username() {
            session = session.with_credentials(username, self.password().unwrap_or_default());
        }
        Ok(Some(session))
    }

    /// Literal username first, then the named environment variable
    pub fn username(&self) -> Option<String> {
        non_empty(self.session.username.as_deref())
            .map(str::to_string)
            .or_else(|| get_env_var_optional(self.session.username_env.as_ref()))
    }

    /// Literal password first, then the named environment variable
    pub fn password(&self) -> Option<String> {
        self.session
            .password
            .clone()
            .or_else(|| get_env_var_optional(self.session.password_env.as_ref()))
    }

    /// Desired subscriptions, with every QoS reset to 0 when the lists disagree
    pub fn subscriptions(&self) -> Vec<Subscription> {
        SubscriptionManager::pair_lists(&self.subscriptions.topics, &self.subscriptions.qos)
    }

    /// Record a session, keeping credentials in the environment when they came from there
    pub fn set_session(&mut self, session: &Session) {
        let section = &mut self.session;
        section.client_id = Some(session.client_id.clone());
        section.server_uri = Some(session.server_uri.clone());
        section.fallback_uris = session.fallback_uris.clone();
        section.clean_session = session.clean_session;
        section.keep_alive_secs = session.keep_alive.as_secs().max(1);
        section.connection_timeout_secs = session.connection_timeout.as_secs().max(1);

        match &session.credentials {
            Some(credentials) => {
                let from_env = get_env_var_optional(section.username_env.as_ref()).as_deref()
                    == Some(credentials.username.as_str())
                    && get_env_var_optional(section.password_env.as_ref()).unwrap_or_default()
                        == credentials.password;
                if from_env {
                    section.username = None;
                    section.password = None;
                } else {
                    section.username = Some(credentials.username.clone());
                    section.password = Some(credentials.password.clone());
                }
            }
            None => {
                section.username = None;
                section.password = None;
            }
        }
    }

    pub fn set_subscriptions(&mut self, subscriptions: &[Subscription]) {
        self.subscriptions.topics = subscriptions.iter().map(|s| s.topic.clone()).collect();
        self.subscriptions.qos = subscriptions.iter().map(|s| u8::from(s.qos)).collect();
    }
}

/// Durable key/value store the session reads at startup and writes on change
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<StoredSettings, ConfigError>;
    fn save(&self, settings: &StoredSettings) -> Result<(), ConfigError>;
}

/// TOML file on disk; a missing file loads as defaults
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<StoredSettings, ConfigError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "config file missing, using defaults");
            return Ok(StoredSettings::default());
        }
        StoredSettings::load_from_file(&self.path)
    }

    fn save(&self, settings: &StoredSettings) -> Result<(), ConfigError> {
        let content = settings.to_toml_string()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "config saved");
        Ok(())
    }
}

/// In-memory store for tests and embedders without durable storage
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    settings: Mutex<StoredSettings>,
    saves: Mutex<usize>,
}

impl MemoryConfigStore {
    pub fn new(settings: StoredSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            saves: Mutex::new(0),
        }
    }

    /// Settings as last saved
    pub fn current(&self) -> StoredSettings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<StoredSettings, ConfigError> {
        Ok(self.current())
    }

    fn save(&self, settings: &StoredSettings) -> Result<(), ConfigError> {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings.clone();
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Helper method to get environment variable with consistent error handling
fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    let name = env_var_name?;
    match std::env::var(name) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(env = %name, "credential environment variable is not set");
            None
        }
    }
}

/// Client ids are restricted to `[a-zA-Z0-9._:-]+`
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'));

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._:-]+"
        )));
    }

    Ok(())
}
