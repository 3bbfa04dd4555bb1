//! rumqttc-backed MQTT v5 transport
//!
//! Split the same way as the rest of the transport layer: pure pieces
//! first, I/O last.
//!
//! - [`options`] - broker URI parsing and `MqttOptions` construction
//! - [`events`] - event routing and delivery-token bookkeeping
//! - [`client`] - the event-loop driver implementing [`Transport`](crate::transport::Transport)
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_session::session::{Session, SessionManager};
//! use mqtt_session::transport::MqttTransport;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let manager = SessionManager::builder(Arc::new(MqttTransport::new()))
//!     .session(Session::new("sensor-17", "mqtt://localhost:1883"))
//!     .build();
//! manager.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod events;
pub mod options;

pub use client::MqttTransport;
pub use events::{route_mqtt_event, DeliveryTracker, EventRoute};
pub use options::{configure_mqtt_options, parse_broker_uri, BrokerAddress};
