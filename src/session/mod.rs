//! Resilient broker session
//!
//! Pure pieces (state table, reconnect policy, data model) sit next to the
//! stateful services that use them: keep-alive scheduling, the desired
//! subscription set, the dispatch pool and the [`SessionManager`] that
//! ties them to a [`Transport`](crate::transport::Transport).

pub mod dispatch;
pub mod keepalive;
pub mod manager;
pub mod model;
pub mod reconnect;
pub mod state;
pub mod subscriptions;

pub use dispatch::{handler_fn, DispatchError, DispatchPool, HandlerError, MessageHandler};
pub use keepalive::{
    ActivityProbe, KeepAliveScheduler, NoopWakeLock, PingCompleter, PingToken, WakeLock,
    WakeTimer, WallClockTimer,
};
pub use manager::{SessionListener, SessionManager, SessionManagerBuilder};
pub use model::{
    Credentials, DeliveryOutcome, DeliveryToken, InboundMessage, OutboundMessage, QoS, Session,
    Subscription,
};
pub use reconnect::{ReconnectAction, ReconnectAttempt, ReconnectPolicy};
pub use state::{ConnectionState, ConnectionStateMachine, StateTrigger, Transition};
pub use subscriptions::{ReplayReport, SubscriptionManager};
