//! Session data model
//!
//! Plain value types shared by the state machine, the transport seam and
//! the application-facing API.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Keep-alive interval used when none is configured
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Connect timeout used when none is configured
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 15;

/// MQTT quality of service level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level {other}, expected 0, 1 or 2")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Broker login
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Everything needed to open one logical broker connection
///
/// A `Session` is frozen while a connection attempt is in flight; the
/// manager only accepts a new one while disconnected.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub client_id: String,
    pub server_uri: String,
    /// Tried in order after `server_uri` fails
    pub fallback_uris: Vec<String>,
    pub credentials: Option<Credentials>,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
}

impl Session {
    pub fn new(client_id: impl Into<String>, server_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            server_uri: server_uri.into(),
            fallback_uris: Vec::new(),
            credentials: None,
            clean_session: false,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
        }
    }

    pub fn with_fallback_uris(mut self, uris: Vec<String>) -> Self {
        self.fallback_uris = uris;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Server URIs in connect order: primary first, then fallbacks
    pub fn server_uris(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.server_uri.as_str())
            .chain(self.fallback_uris.iter().map(String::as_str))
            .filter(|uri| !uri.trim().is_empty())
    }

    /// Reject sessions that can never connect
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.client_id.trim().is_empty() {
            return Err(SessionError::InvalidConfiguration(
                "client id is empty".to_string(),
            ));
        }
        if self.server_uri.trim().is_empty() {
            return Err(SessionError::InvalidConfiguration(
                "server URI is empty".to_string(),
            ));
        }
        if self.keep_alive.is_zero() {
            return Err(SessionError::InvalidConfiguration(
                "keep-alive interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One entry of the desired subscription set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// Message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
}

impl InboundMessage {
    /// Payload as text, replacing invalid UTF-8
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Message handed to the transport by `publish`
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retained: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }
}

/// Identifies one publish until its delivery callback arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryToken(pub u64);

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Final result of a publish as reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}
