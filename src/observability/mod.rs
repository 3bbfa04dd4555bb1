//! Observability: structured logging setup and per-session metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{DispatchMetrics, MetricsSnapshot, SessionMetrics};

pub use logging::{session_span, transport_span};
