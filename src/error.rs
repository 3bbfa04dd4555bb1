//! Error types for session operations
//!
//! Public `SessionManager` operations return [`SessionError`]. Transport and
//! configuration failures convert into it with `?`; everything else in the
//! session is reported through state transitions and listener callbacks.

use crate::config::ConfigError;
use crate::session::state::ConnectionState;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Longest cause string handed to listeners and logs
pub const MAX_CAUSE_LEN: usize = 500;

/// Errors returned synchronously by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session is missing or unusable; the caller must reconfigure
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },

    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState {
        state: ConnectionState,
        operation: &'static str,
    },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Session is closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SessionError {
    pub fn invalid_configuration<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    pub fn invalid_message<S: Into<String>>(message: S) -> Self {
        Self::InvalidMessage(message.into())
    }

    /// Error for an operation refused in `state`
    pub fn refused(state: ConnectionState, operation: &'static str) -> Self {
        match state {
            ConnectionState::Closed => Self::Closed,
            state => Self::InvalidState { state, operation },
        }
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

static SECRET_PAIR: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|passwd|token|secret)[=:]\s*\S+").ok());

static URI_USERINFO: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\b(mqtts?|tcp|ssl|wss?)://[^/@\s]+@").ok());

/// Strip credentials from a failure cause before it is logged or surfaced
pub fn sanitize_cause(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_PAIR.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").to_string();
    }
    if let Some(re) = URI_USERINFO.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}://***@").to_string();
    }

    if sanitized.len() > MAX_CAUSE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_CAUSE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}
