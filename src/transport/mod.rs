//! Transport seam
//!
//! The session drives a [`Transport`] and learns about the outcome of its
//! asynchronous operations through [`TransportEvent`]s pushed into a
//! [`TransportListener`]. Wire encoding, sockets and TLS live behind this
//! trait; [`mqtt::MqttTransport`] is the rumqttc-backed implementation.

use crate::session::keepalive::PingToken;
use crate::session::model::{
    DeliveryOutcome, DeliveryToken, InboundMessage, OutboundMessage, Session, Subscription,
};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid broker URI: {0}")]
    InvalidUri(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] BoxError),
    #[error("Unsubscribe failed")]
    UnsubscribeFailed(#[source] BoxError),
    #[error("Publishing failed")]
    PublishFailed(#[source] BoxError),
    #[error("Transport closed")]
    Closed,
}

/// Callbacks from the transport, delivered in order on one channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker acknowledged the connection
    ConnectSuccess { server_uri: String },
    /// Every configured broker refused or timed out
    ConnectFailure { reason: String },
    /// An established link dropped
    ConnectionLost { cause: String },
    MessageArrived(InboundMessage),
    DeliveryComplete {
        token: DeliveryToken,
        outcome: DeliveryOutcome,
    },
    /// Orderly disconnect finished
    DisconnectComplete,
}

/// Sink the transport pushes events into
pub type TransportListener = mpsc::UnboundedSender<TransportEvent>;

/// Operations the session needs from an MQTT client library
///
/// Calls return once the request is handed to the client; outcomes of
/// `connect` and `disconnect` arrive later as [`TransportEvent`]s.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting; exactly one ConnectSuccess or ConnectFailure follows
    async fn connect(&self, session: &Session, listener: TransportListener)
        -> Result<(), TransportError>;

    /// Start an orderly disconnect; DisconnectComplete follows
    async fn disconnect(&self, listener: TransportListener) -> Result<(), TransportError>;

    /// Release everything; no events are sent afterwards
    async fn close(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError>;

    /// Hand a message to the client; the outcome arrives as DeliveryComplete
    async fn publish(&self, message: &OutboundMessage) -> Result<DeliveryToken, TransportError>;

    fn is_connected(&self) -> bool;

    /// Ping the broker if the link has been idle; `None` when no ping was needed
    fn check_for_activity(&self) -> Option<PingToken>;
}

pub use mqtt::MqttTransport;
