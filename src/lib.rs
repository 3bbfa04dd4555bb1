//! MQTT Session - resilient broker sessions in Rust
//!
//! Keeps one logical MQTT connection alive across broker failures and
//! network changes.
//!
//! # Overview
//!
//! - Connection lifecycle state machine with single-writer transitions
//! - Linear-then-capped reconnect backoff that waits out offline periods
//! - Keep-alive pings scheduled against the wall clock, wake-lock protected
//! - Desired subscription set replayed on every (re)connect
//! - Bounded worker pool for inbound message handling
//! - TOML-backed configuration store
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_session::session::{
//!     handler_fn, HandlerError, OutboundMessage, QoS, Session, SessionManager,
//! };
//! use mqtt_session::transport::MqttTransport;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let manager = SessionManager::builder(Arc::new(MqttTransport::new()))
//!     .session(Session::new("sensor-17", "mqtt://localhost:1883"))
//!     .handler(handler_fn(|message| async move {
//!         println!("{} -> {}", message.topic, message.payload_str());
//!         Ok::<(), HandlerError>(())
//!     }))
//!     .build();
//!
//! manager.subscribe("sensors/+/cmd", QoS::AtLeastOnce).await?;
//! manager.connect().await?;
//! manager
//!     .publish(OutboundMessage::new("sensors/17/state", "online").with_qos(QoS::AtLeastOnce))
//!     .await
//!     .ok();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ConfigStore, FileConfigStore, MemoryConfigStore, StoredSettings};
pub use error::{SessionError, SessionResult};
pub use session::{
    ConnectionState, OutboundMessage, QoS, Session, SessionListener, SessionManager,
    Subscription,
};
pub use transport::{MqttTransport, Transport, TransportError, TransportEvent};
