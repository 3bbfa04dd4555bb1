//! Session orchestrator
//!
//! [`SessionManager`] owns the transport handle and composes the state
//! machine, reconnect policy, keep-alive scheduler, subscription set and
//! dispatch pool. Transport callbacks, retry timers and reachability changes
//! are all funnelled into one event pump task, so they are handled one at a
//! time and in arrival order; application calls serialize with them through
//! the state machine.

use super::dispatch::{DispatchPool, MessageHandler};
use super::keepalive::{
    ActivityProbe, KeepAliveScheduler, NoopWakeLock, PingToken, WakeLock, WakeTimer,
    WallClockTimer,
};
use super::model::{
    DeliveryOutcome, DeliveryToken, OutboundMessage, QoS, Session, Subscription,
};
use super::reconnect::{ReconnectAction, ReconnectAttempt, ReconnectPolicy};
use super::state::{ConnectionState, ConnectionStateMachine, StateTrigger, Transition};
use super::subscriptions::SubscriptionManager;
use crate::config::{ConfigStore, StoredSettings};
use crate::error::{sanitize_cause, SessionError, SessionResult};
use crate::observability::metrics::{DispatchMetrics, MetricsSnapshot, SessionMetrics};
use crate::session_span;
use crate::transport::{Transport, TransportEvent, TransportListener};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Grace period for the event pump to exit on close
const PUMP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Session-level notifications for the embedding application
///
/// Callbacks run on the event pump; keep them short.
pub trait SessionListener: Send + Sync {
    fn on_connected(&self);

    fn on_connection_lost(&self, cause: &str);

    /// Only called while broadcast-on-receive is enabled
    fn on_message_received(&self, topic: &str, payload: &[u8]);

    fn on_delivery_complete(&self, _token: DeliveryToken, _outcome: &DeliveryOutcome) {}
}

/// Work for the pump that does not come from the transport
#[derive(Debug)]
enum Control {
    RetryDue { generation: u64 },
    Network(bool),
}

#[derive(Debug)]
struct PendingRetry {
    generation: u64,
    delay: Duration,
    handle: JoinHandle<()>,
}

/// Adapts the transport's idle check to the keep-alive scheduler
struct TransportProbe(Arc<dyn Transport>);

impl ActivityProbe for TransportProbe {
    fn check_for_activity(&self) -> Option<PingToken> {
        self.0.check_for_activity()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    transport: Arc<dyn Transport>,
    state: ConnectionStateMachine,
    subscriptions: SubscriptionManager,
    keepalive: KeepAliveScheduler,
    dispatch: Option<DispatchPool>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
    policy: ReconnectPolicy,
    metrics: SessionMetrics,

    session: Mutex<Option<Session>>,
    attempt: Mutex<ReconnectAttempt>,
    last_action: Mutex<Option<ReconnectAction>>,
    retry: Mutex<Option<PendingRetry>>,
    retry_generation: AtomicU64,
    /// Set by connect/start, cleared by disconnect/close
    auto_reconnect: AtomicBool,
    broadcast: AtomicBool,

    events_tx: TransportListener,
    control_tx: mpsc::UnboundedSender<Control>,

    store: Option<Arc<dyn ConfigStore>>,
    settings: Mutex<StoredSettings>,
}

/// Builder for [`SessionManager`]
pub struct SessionManagerBuilder {
    transport: Arc<dyn Transport>,
    session: Option<Session>,
    subscriptions: Vec<Subscription>,
    handler: Option<Arc<dyn MessageHandler>>,
    dispatch_workers: Option<usize>,
    wake_timer: Option<Arc<dyn WakeTimer>>,
    wake_lock: Option<Arc<dyn WakeLock>>,
    reachability: Option<watch::Receiver<bool>>,
    listeners: Vec<Arc<dyn SessionListener>>,
    store: Option<Arc<dyn ConfigStore>>,
    settings: Option<StoredSettings>,
    broadcast: Option<bool>,
}

impl SessionManagerBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            session: None,
            subscriptions: Vec::new(),
            handler: None,
            dispatch_workers: None,
            wake_timer: None,
            wake_lock: None,
            reachability: None,
            listeners: Vec::new(),
            store: None,
            settings: None,
            broadcast: None,
        }
    }

    pub fn session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn subscriptions(mut self, subscriptions: Vec<Subscription>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    /// Handler run on the dispatch pool for every inbound message
    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Override the pool size (default: three workers per core)
    pub fn dispatch_workers(mut self, workers: usize) -> Self {
        self.dispatch_workers = Some(workers);
        self
    }

    pub fn wake_timer(mut self, timer: Arc<dyn WakeTimer>) -> Self {
        self.wake_timer = Some(timer);
        self
    }

    pub fn wake_lock(mut self, lock: Arc<dyn WakeLock>) -> Self {
        self.wake_lock = Some(lock);
        self
    }

    /// Network reachability source; `true` means some path is up
    pub fn reachability(mut self, reachability: watch::Receiver<bool>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = Some(enabled);
        self
    }

    /// Write configuration changes through to `store`
    pub fn store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Document the first write-through starts from: the store's current
    /// contents with this builder's session, subscriptions and flags applied
    fn seed_settings(&mut self) -> StoredSettings {
        let mut settings = match (self.settings.take(), &self.store) {
            (Some(settings), _) => settings,
            (None, Some(store)) => store.load().unwrap_or_else(|e| {
                warn!(error = %e, "Could not load stored settings, starting from defaults");
                StoredSettings::default()
            }),
            (None, None) => StoredSettings::default(),
        };
        if let Some(session) = &self.session {
            settings.set_session(session);
        }
        if !self.subscriptions.is_empty() {
            settings.set_subscriptions(&self.subscriptions);
        }
        if let Some(broadcast) = self.broadcast {
            settings.broadcast = broadcast;
        }
        settings
    }

    /// Spawn the event pump; must be called inside a tokio runtime
    pub fn build(mut self) -> SessionManager {
        let settings = self.seed_settings();
        let broadcast = settings.broadcast;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let keepalive = KeepAliveScheduler::new(
            self.wake_timer
                .unwrap_or_else(|| Arc::new(WallClockTimer::default())),
            Arc::new(TransportProbe(self.transport.clone())),
            self.wake_lock.unwrap_or_else(|| Arc::new(NoopWakeLock)),
        );

        let dispatch = self.handler.map(|handler| {
            DispatchPool::new(
                self.dispatch_workers
                    .unwrap_or_else(DispatchPool::default_size),
                handler,
            )
        });

        let network_available = self
            .reachability
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(true);

        let subscriptions = SubscriptionManager::new();
        subscriptions.replace_all(self.subscriptions);

        let client_id = self
            .session
            .as_ref()
            .map(|s| s.client_id.clone())
            .unwrap_or_else(|| "unconfigured".to_string());

        let inner = Arc::new(Inner {
            transport: self.transport,
            state: ConnectionStateMachine::new(),
            subscriptions,
            keepalive,
            dispatch,
            listeners: RwLock::new(self.listeners),
            policy: ReconnectPolicy,
            metrics: SessionMetrics::new(),
            session: Mutex::new(self.session),
            attempt: Mutex::new(ReconnectAttempt {
                network_available,
                ..Default::default()
            }),
            last_action: Mutex::new(None),
            retry: Mutex::new(None),
            retry_generation: AtomicU64::new(0),
            auto_reconnect: AtomicBool::new(false),
            broadcast: AtomicBool::new(broadcast),
            events_tx,
            control_tx,
            store: self.store,
            settings: Mutex::new(settings),
        });

        let pump = tokio::spawn(
            run_event_pump(
                inner.clone(),
                events_rx,
                control_rx,
                self.reachability,
                shutdown_rx,
            )
            .instrument(session_span!(client_id = %client_id)),
        );

        SessionManager {
            inner,
            shutdown_tx,
            pump: Mutex::new(Some(pump)),
        }
    }
}

/// Handle to one resilient broker session
///
/// Owned by the embedding process; dropping it stops the event pump and
/// cancels any pending retry.
pub struct SessionManager {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}

impl SessionManager {
    pub fn builder(transport: Arc<dyn Transport>) -> SessionManagerBuilder {
        SessionManagerBuilder::new(transport)
    }

    /// Builder pre-loaded with the session, subscriptions and flags in `store`
    pub fn from_store(
        transport: Arc<dyn Transport>,
        store: Arc<dyn ConfigStore>,
    ) -> SessionResult<SessionManagerBuilder> {
        let settings = store.load()?;
        let mut builder = SessionManagerBuilder::new(transport)
            .subscriptions(settings.subscriptions())
            .broadcast(settings.broadcast);
        if let Some(session) = settings.session()? {
            builder = builder.session(session);
        } else {
            warn!("stored settings have no client id or server URI; configure before connecting");
        }
        builder.settings = Some(settings);
        Ok(builder.store(store))
    }

    /// Replace the session; only allowed while disconnected
    pub fn configure(&self, session: Session) -> SessionResult<()> {
        session.validate()?;
        {
            let mut current = lock(&self.inner.session);
            let state = self.inner.state.current();
            if state != ConnectionState::Disconnected {
                return Err(SessionError::refused(state, "configure"));
            }
            info!(
                client_id = %session.client_id,
                server_uri = %session.server_uri,
                "Session configured"
            );
            *current = Some(session.clone());
        }
        self.inner.cancel_retry();
        lock(&self.inner.attempt).reset();
        self.inner.persist(|settings| settings.set_session(&session));
        Ok(())
    }

    /// Start connecting; a no-op while already connecting or connected
    pub async fn connect(&self) -> SessionResult<()> {
        if self.inner.state.current() == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }
        self.inner.auto_reconnect.store(true, Ordering::SeqCst);
        self.inner.begin_connect("request").await
    }

    /// Start an orderly disconnect and stop reconnecting
    pub async fn disconnect(&self) -> SessionResult<()> {
        let inner = &self.inner;
        inner.auto_reconnect.store(false, Ordering::SeqCst);
        inner.cancel_retry();

        match inner.state.apply(StateTrigger::Disconnect) {
            Transition::Changed { .. } => {
                inner.keepalive.stop();
                if let Err(e) = inner.transport.disconnect(inner.events_tx.clone()).await {
                    warn!(error = %e, "Transport disconnect failed, forcing completion");
                    let _ = inner.events_tx.send(TransportEvent::DisconnectComplete);
                }
                Ok(())
            }
            Transition::Unchanged(_) | Transition::Rejected(ConnectionState::Closed) => Ok(()),
            Transition::Rejected(state) => Err(SessionError::refused(state, "disconnect")),
        }
    }

    /// Tear the session down for good and drain the dispatch pool
    pub async fn close(&self) -> SessionResult<()> {
        let inner = &self.inner;
        let transition = inner.state.apply(StateTrigger::Close);
        inner.auto_reconnect.store(false, Ordering::SeqCst);
        inner.cancel_retry();
        inner.keepalive.stop();

        if transition.is_changed() {
            if let Err(e) = inner.transport.close().await {
                warn!(error = %e, "Transport close failed");
            }
            inner.metrics.connection_closed();
        }

        self.stop_pump().await;
        if let Some(pool) = &inner.dispatch {
            pool.shutdown().await;
        }
        Ok(())
    }

    /// Persist auto-start and connect
    pub async fn start(&self) -> SessionResult<()> {
        if lock(&self.inner.session).is_none() {
            return Err(SessionError::invalid_configuration("no session configured"));
        }
        self.set_auto_start(true);
        self.connect().await
    }

    /// Clear auto-start and close
    pub async fn stop(&self) -> SessionResult<()> {
        self.set_auto_start(false);
        self.close().await
    }

    /// Hand a message to the transport; only allowed while connected
    pub async fn publish(&self, message: OutboundMessage) -> SessionResult<DeliveryToken> {
        match self.inner.state.current() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(SessionError::Closed),
            state => return Err(SessionError::NotConnected { state }),
        }
        if message.topic.trim().is_empty() {
            return Err(SessionError::invalid_message("topic is empty"));
        }
        if message.topic.contains(['+', '#']) {
            return Err(SessionError::invalid_message(
                "wildcards are not allowed in publish topics",
            ));
        }

        match self.inner.transport.publish(&message).await {
            Ok(token) => {
                self.inner.metrics.message_published();
                debug!(
                    target: "mqtt_session",
                    topic = %message.topic,
                    token = %token,
                    "Message published"
                );
                Ok(token)
            }
            Err(e) => {
                self.inner.metrics.publish_failed();
                warn!(topic = %message.topic, error = %e, "Publish failed");
                Err(e.into())
            }
        }
    }

    /// Add or update a desired subscription; applied now if connected
    pub async fn subscribe(&self, topic: impl Into<String>, qos: QoS) -> SessionResult<()> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(SessionError::invalid_message("topic is empty"));
        }
        if self.inner.state.current() == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }

        // Desired set first: a replay that starts after this sees the topic,
        // one that already ran is followed by the live call below.
        if self.inner.subscriptions.subscribe(topic.clone(), qos) {
            self.inner.persist_subscriptions();
        }
        if self.inner.state.current() == ConnectionState::Connected {
            let subscription = [Subscription::new(topic.clone(), qos)];
            if let Err(e) = self.inner.transport.subscribe(&subscription).await {
                warn!(topic = %topic, error = %e, "Subscribe failed, will retry on next connect");
            }
        }
        Ok(())
    }

    /// Remove a desired subscription; applied now if connected
    pub async fn unsubscribe(&self, topic: &str) -> SessionResult<()> {
        if self.inner.state.current() == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }

        if !self.inner.subscriptions.unsubscribe(topic) {
            debug!(topic, "unsubscribe for unknown topic");
            return Ok(());
        }
        self.inner.persist_subscriptions();
        if self.inner.state.current() == ConnectionState::Connected {
            if let Err(e) = self.inner.transport.unsubscribe(&[topic.to_string()]).await {
                warn!(topic, error = %e, "Unsubscribe failed");
            }
        }
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Toggle forwarding of inbound messages to listeners
    pub fn set_broadcast(&self, enabled: bool) {
        self.inner.broadcast.store(enabled, Ordering::SeqCst);
        self.inner.persist(|settings| settings.broadcast = enabled);
    }

    pub fn broadcast_enabled(&self) -> bool {
        self.inner.broadcast.load(Ordering::SeqCst)
    }

    pub fn set_auto_start(&self, enabled: bool) {
        self.inner.persist(|settings| settings.auto_start = enabled);
    }

    pub fn auto_start(&self) -> bool {
        lock(&self.inner.settings).auto_start
    }

    /// Report a reachability change when no watch channel was supplied
    pub fn set_network_available(&self, available: bool) {
        if self.inner.control_tx.send(Control::Network(available)).is_err() {
            debug!("event pump stopped, reachability change ignored");
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Receiver observing every settled state
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn session(&self) -> Option<Session> {
        lock(&self.inner.session).clone()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscriptions.desired()
    }

    pub fn reconnect_attempt(&self) -> ReconnectAttempt {
        lock(&self.inner.attempt).clone()
    }

    /// Most recent policy decision after a failure
    pub fn last_reconnect_action(&self) -> Option<ReconnectAction> {
        *lock(&self.inner.last_action)
    }

    /// Delay of the armed retry timer, if any
    pub fn pending_retry(&self) -> Option<Duration> {
        lock(&self.inner.retry).as_ref().map(|retry| retry.delay)
    }

    pub fn keepalive_running(&self) -> bool {
        self.inner.keepalive.is_running()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let dispatch = inner
            .dispatch
            .as_ref()
            .map(|pool| DispatchMetrics {
                workers: pool.size(),
                pending: pool.pending(),
                completed: pool.completed(),
                failed: pool.failed(),
            })
            .unwrap_or_default();
        inner.metrics.snapshot(
            inner.state.current(),
            lock(&inner.attempt).count,
            dispatch,
            inner.keepalive.wakeups(),
        )
    }

    async fn stop_pump(&self) {
        let _ = self.shutdown_tx.send(true);
        let Some(handle) = lock(&self.pump).take() else {
            return;
        };
        match tokio::time::timeout(PUMP_SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => debug!("event pump stopped"),
            Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "event pump ended with error"),
            Ok(Err(_)) => {}
            Err(_) => warn!("event pump did not stop in time"),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.inner.auto_reconnect.store(false, Ordering::SeqCst);
        self.inner.cancel_retry();
        self.inner.keepalive.stop();
    }
}

impl Inner {
    async fn begin_connect(&self, origin: &'static str) -> SessionResult<()> {
        let session = {
            let session = lock(&self.session);
            let session = session
                .clone()
                .ok_or_else(|| SessionError::invalid_configuration("no session configured"))?;
            session.validate()?;
            match self.state.apply(StateTrigger::Connect) {
                Transition::Changed { .. } => session,
                Transition::Unchanged(state) => {
                    debug!(state = %state, origin, "connect ignored, attempt already in flight");
                    return Ok(());
                }
                Transition::Rejected(state) => return Err(SessionError::refused(state, "connect")),
            }
        };

        self.cancel_retry();
        self.metrics.connect_attempt();
        info!(
            client_id = %session.client_id,
            server_uri = %sanitize_cause(&session.server_uri),
            fallbacks = session.fallback_uris.len(),
            origin,
            "Connecting"
        );

        if let Err(e) = self.transport.connect(&session, self.events_tx.clone()).await {
            let _ = self.events_tx.send(TransportEvent::ConnectFailure {
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectSuccess { server_uri } => {
                self.on_connect_success(&server_uri).await
            }
            TransportEvent::ConnectFailure { reason } => {
                let reason = sanitize_cause(&reason);
                match self.state.apply(StateTrigger::ConnectFailed) {
                    Transition::Changed { .. } => {
                        warn!(reason = %reason, "Connect attempt failed");
                        self.metrics.connect_failed(Utc::now());
                        self.schedule_reconnect();
                        self.notify(|l| l.on_connection_lost(&reason));
                    }
                    _ => debug!(reason = %reason, "stale connect failure ignored"),
                }
            }
            TransportEvent::ConnectionLost { cause } => {
                let cause = sanitize_cause(&cause);
                self.keepalive.stop();
                match self.state.apply(StateTrigger::ConnectionLost) {
                    Transition::Changed { to: ConnectionState::Disconnected, .. } => {
                        warn!(cause = %cause, "Connection lost");
                        self.metrics.connection_lost(Utc::now());
                        self.schedule_reconnect();
                        self.notify(|l| l.on_connection_lost(&cause));
                    }
                    Transition::Changed { .. } => {
                        info!(cause = %cause, "Connection dropped during disconnect");
                        self.metrics.connection_closed();
                        self.notify(|l| l.on_connection_lost(&cause));
                    }
                    _ => debug!(cause = %cause, "stale connection loss ignored"),
                }
            }
            TransportEvent::MessageArrived(message) => {
                if self.state.current() != ConnectionState::Connected {
                    self.metrics.message_dropped();
                    debug!(topic = %message.topic, "message dropped, session not connected");
                    return;
                }
                self.metrics.message_received();
                debug!(
                    target: "mqtt_session",
                    topic = %message.topic,
                    bytes = message.payload.len(),
                    "Message arrived"
                );

                if self.broadcast.load(Ordering::SeqCst) {
                    self.notify(|l| l.on_message_received(&message.topic, &message.payload));
                }
                if let Some(pool) = &self.dispatch {
                    if let Err(e) = pool.submit(message) {
                        self.metrics.message_dropped();
                        warn!(error = %e, "message not dispatched");
                    }
                }
            }
            TransportEvent::DeliveryComplete { token, outcome } => {
                match &outcome {
                    DeliveryOutcome::Delivered => debug!(token = %token, "Delivery complete"),
                    DeliveryOutcome::Failed(reason) => {
                        warn!(token = %token, reason = %reason, "Delivery failed")
                    }
                }
                self.metrics
                    .delivery_completed(outcome == DeliveryOutcome::Delivered);
                self.notify(|l| l.on_delivery_complete(token, &outcome));
            }
            TransportEvent::DisconnectComplete => {
                self.keepalive.stop();
                if self.state.apply(StateTrigger::DisconnectCompleted).is_changed() {
                    info!("Disconnected");
                    self.metrics.connection_closed();
                    self.notify(|l| l.on_connection_lost("disconnected"));
                }
            }
        }
    }

    async fn on_connect_success(&self, server_uri: &str) {
        if !self.state.apply(StateTrigger::ConnectSucceeded).is_changed() {
            debug!(server_uri, "stale connect success ignored");
            return;
        }
        info!(server_uri = %sanitize_cause(server_uri), "Connected");

        lock(&self.attempt).reset();
        self.cancel_retry();
        self.metrics.connection_established();

        let report = self.subscriptions.replay(self.transport.as_ref()).await;
        debug!(
            topics = report.topics.len(),
            subscribed = report.subscribe_ok,
            "subscription replay finished"
        );

        let keep_alive = lock(&self.session).as_ref().map(|s| s.keep_alive);
        if let Some(interval) = keep_alive {
            self.keepalive.start(interval);
        }
        self.notify(|l| l.on_connected());
    }

    async fn handle_control(&self, control: Control) {
        match control {
            Control::RetryDue { generation } => {
                let due = {
                    let mut retry = lock(&self.retry);
                    match retry.as_ref() {
                        Some(pending) if pending.generation == generation => retry.take().is_some(),
                        _ => false,
                    }
                };
                if !due {
                    debug!(generation, "stale retry ignored");
                    return;
                }
                if !self.auto_reconnect.load(Ordering::SeqCst)
                    || self.state.current() != ConnectionState::Disconnected
                {
                    return;
                }
                if let Err(e) = self.begin_connect("retry").await {
                    error!(error = %e, "Reconnect attempt could not start");
                }
            }
            Control::Network(available) => self.on_network_change(available).await,
        }
    }

    async fn on_network_change(&self, available: bool) {
        let previous = {
            let mut attempt = lock(&self.attempt);
            std::mem::replace(&mut attempt.network_available, available)
        };
        if previous == available {
            return;
        }
        info!(available, "Network reachability changed");

        match self.policy.on_network_change(available) {
            ReconnectAction::WaitForNetwork => self.cancel_retry(),
            ReconnectAction::Immediate => {
                if !self.auto_reconnect.load(Ordering::SeqCst)
                    || self.state.current() != ConnectionState::Disconnected
                {
                    return;
                }
                self.cancel_retry();
                if let Err(e) = self.begin_connect("network").await {
                    error!(error = %e, "Reconnect on network restore could not start");
                }
            }
            ReconnectAction::DelayedBy(delay) => self.arm_retry(delay),
        }
    }

    /// Consult the policy for the current streak, then count this failure
    fn schedule_reconnect(&self) {
        if !self.auto_reconnect.load(Ordering::SeqCst) {
            debug!("reconnect suspended");
            return;
        }
        let (action, count) = {
            let mut attempt = lock(&self.attempt);
            let action = self.policy.next_action(&attempt);
            attempt.record_failure(Utc::now());
            (action, attempt.count)
        };
        *lock(&self.last_action) = Some(action);

        match action {
            ReconnectAction::Immediate => self.arm_retry(Duration::ZERO),
            ReconnectAction::DelayedBy(delay) => {
                info!(attempt = count, delay_secs = delay.as_secs(), "Reconnect scheduled");
                self.arm_retry(delay);
            }
            ReconnectAction::WaitForNetwork => {
                info!(attempt = count, "Network unavailable, waiting for reachability");
            }
        }
    }

    fn arm_retry(&self, delay: Duration) {
        let generation = self.retry_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let control = self.control_tx.clone();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = control.send(Control::RetryDue { generation });
        });
        let previous = lock(&self.retry).replace(PendingRetry {
            generation,
            delay,
            handle,
        });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    fn cancel_retry(&self) {
        self.retry_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(pending) = lock(&self.retry).take() {
            pending.handle.abort();
            debug!(generation = pending.generation, "pending retry cancelled");
        }
    }

    fn notify(&self, call: impl Fn(&dyn SessionListener)) {
        let listeners: Vec<Arc<dyn SessionListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            call(listener.as_ref());
        }
    }

    fn persist(&self, update: impl FnOnce(&mut StoredSettings)) {
        let snapshot = {
            let mut settings = lock(&self.settings);
            update(&mut settings);
            settings.clone()
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&snapshot) {
                warn!(error = %e, "Failed to persist settings");
            }
        }
    }

    fn persist_subscriptions(&self) {
        let desired = self.subscriptions.desired();
        self.persist(|settings| settings.set_subscriptions(&desired));
    }
}

async fn next_reachability(reachability: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match reachability {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

async fn run_event_pump(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut control: mpsc::UnboundedReceiver<Control>,
    mut reachability: Option<watch::Receiver<bool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("event pump started");
    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(command) = control.recv() => inner.handle_control(command).await,
            Some(event) = events.recv() => inner.handle_transport_event(event).await,
            available = next_reachability(&mut reachability) => match available {
                Some(available) => inner.on_network_change(available).await,
                None => {
                    debug!("reachability source closed");
                    reachability = None;
                }
            },
        }
    }
    debug!("event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use crate::testing::mocks::{
        ConnectOutcome, ListenerEvent, MockTransport, MockWakeLock, MockWakeTimer,
        RecordingListener, TransportCall,
    };

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        manager: SessionManager,
        transport: Arc<MockTransport>,
        listener: Arc<RecordingListener>,
        timer: Arc<MockWakeTimer>,
    }

    fn harness(configure: impl FnOnce(SessionManagerBuilder) -> SessionManagerBuilder) -> Harness {
        let transport = Arc::new(MockTransport::new());
        let listener = Arc::new(RecordingListener::new());
        let timer = Arc::new(MockWakeTimer::new());
        let builder = SessionManager::builder(transport.clone())
            .session(Session::new("unit-client", "mqtt://localhost:1883"))
            .wake_timer(timer.clone())
            .wake_lock(Arc::new(MockWakeLock::new()))
            .listener(listener.clone());
        Harness {
            manager: configure(builder).build(),
            transport,
            listener,
            timer,
        }
    }

    async fn wait_for_state(manager: &SessionManager, expected: ConnectionState) {
        let mut rx = manager.subscribe_state();
        tokio::time::timeout(WAIT, rx.wait_for(|state| *state == expected))
            .await
            .unwrap_or_else(|_| panic!("state never became {expected}"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_session_is_invalid_configuration() {
        let manager = SessionManager::builder(Arc::new(MockTransport::new())).build();
        assert!(matches!(
            manager.connect().await,
            Err(SessionError::InvalidConfiguration(_))
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_while_connecting_is_noop() {
        let h = harness(|b| b);
        h.transport.script_connects([ConnectOutcome::Hang]);

        h.manager.connect().await.unwrap();
        h.manager.connect().await.unwrap();

        assert_eq!(h.manager.state(), ConnectionState::Connecting);
        assert_eq!(h.transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_success_starts_keepalive_and_notifies() {
        let h = harness(|b| b);
        h.manager.connect().await.unwrap();
        wait_for_state(&h.manager, ConnectionState::Connected).await;

        assert!(h.listener.wait_until(WAIT, |e| e.contains(&ListenerEvent::Connected)).await);
        assert!(h.manager.keepalive_running());
        assert_eq!(h.timer.armed(), 1);
        assert_eq!(h.manager.reconnect_attempt().count, 0);
    }

    #[tokio::test]
    async fn test_publish_rules() {
        let h = harness(|b| b);
        let message = OutboundMessage::new("a/b", "hello");

        assert!(matches!(
            h.manager.publish(message.clone()).await,
            Err(SessionError::NotConnected { state: ConnectionState::Disconnected })
        ));

        h.manager.connect().await.unwrap();
        wait_for_state(&h.manager, ConnectionState::Connected).await;

        assert!(matches!(
            h.manager.publish(OutboundMessage::new("", "x")).await,
            Err(SessionError::InvalidMessage(_))
        ));
        assert!(matches!(
            h.manager.publish(OutboundMessage::new("a/#", "x")).await,
            Err(SessionError::InvalidMessage(_))
        ));

        let token = h.manager.publish(message.clone()).await.unwrap();
        assert_eq!(h.transport.published(), vec![message]);
        let delivered = ListenerEvent::Delivery(token, DeliveryOutcome::Delivered);
        assert!(h.listener.wait_until(WAIT, |e| e.contains(&delivered)).await);
    }

    #[tokio::test]
    async fn test_configure_only_while_disconnected() {
        let h = harness(|b| b);
        h.manager.connect().await.unwrap();
        wait_for_state(&h.manager, ConnectionState::Connected).await;

        let result = h.manager.configure(Session::new("other", "mqtt://elsewhere:1883"));
        assert!(matches!(
            result,
            Err(SessionError::InvalidState { operation: "configure", .. })
        ));
        assert!(matches!(
            h.manager.configure(Session::new("", "mqtt://x")),
            Err(SessionError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_is_durable_and_applied_live() {
        let h = harness(|b| b);
        h.manager.subscribe("early/topic", QoS::AtLeastOnce).await.unwrap();
        assert!(h.transport.calls().is_empty());

        h.manager.connect().await.unwrap();
        wait_for_state(&h.manager, ConnectionState::Connected).await;
        h.transport.clear_calls();

        h.manager.subscribe("late/topic", QoS::AtMostOnce).await.unwrap();
        h.manager.unsubscribe("early/topic").await.unwrap();

        assert_eq!(
            h.transport.calls(),
            vec![
                TransportCall::Subscribe(vec![Subscription::new("late/topic", QoS::AtMostOnce)]),
                TransportCall::Unsubscribe(vec!["early/topic".to_string()]),
            ]
        );
        assert_eq!(
            h.manager.subscriptions(),
            vec![Subscription::new("late/topic", QoS::AtMostOnce)]
        );
    }

    #[tokio::test]
    async fn test_broadcast_flag_controls_listener_messages() {
        let h = harness(|b| b);
        h.manager.connect().await.unwrap();
        wait_for_state(&h.manager, ConnectionState::Connected).await;

        h.transport.deliver("quiet/topic", b"1");
        h.manager.set_broadcast(true);
        h.transport.deliver("loud/topic", b"2");

        let loud = |ev: &ListenerEvent| {
            matches!(ev, ListenerEvent::Message { topic, .. } if topic == "loud/topic")
        };
        assert!(h.listener.wait_until(WAIT, |e| e.iter().any(loud)).await);
        assert_eq!(
            h.listener.count(|e| matches!(e, ListenerEvent::Message { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_disconnect_cancels_retry_and_suspends_reconnect() {
        let h = harness(|b| b);
        h.transport.script_connects([
            ConnectOutcome::Fail("refused".into()),
            ConnectOutcome::Fail("refused".into()),
        ]);
        h.manager.connect().await.unwrap();

        // First failure retries immediately, second arms a 5 s timer
        let lost = |ev: &&ListenerEvent| matches!(ev, ListenerEvent::ConnectionLost(_));
        assert!(
            h.listener
                .wait_until(WAIT, |e| e.iter().filter(lost).count() == 2)
                .await
        );
        assert_eq!(h.manager.pending_retry(), Some(Duration::from_secs(5)));

        h.manager.disconnect().await.unwrap();
        assert_eq!(h.manager.pending_retry(), None);
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connection_lost_while_offline_waits_for_network() {
        let h = harness(|b| b);
        h.manager.connect().await.unwrap();
        wait_for_state(&h.manager, ConnectionState::Connected).await;

        h.manager.set_network_available(false);
        h.transport.drop_connection("link down");
        wait_for_state(&h.manager, ConnectionState::Disconnected).await;

        assert_eq!(h.manager.last_reconnect_action(), Some(ReconnectAction::WaitForNetwork));
        assert_eq!(h.manager.pending_retry(), None);
        assert!(!h.manager.keepalive_running());

        h.manager.set_network_available(true);
        wait_for_state(&h.manager, ConnectionState::Connected).await;
        assert_eq!(h.transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_configuration_writes_through_to_store() {
        let store = Arc::new(MemoryConfigStore::default());
        let h = harness(|b| b.store(store.clone()));

        h.manager.configure(Session::new("stored", "mqtt://stored:1883")).unwrap();
        h.manager.subscribe("x/y", QoS::ExactlyOnce).await.unwrap();
        h.manager.set_broadcast(true);
        h.manager.set_auto_start(true);

        let saved = store.current();
        assert_eq!(saved.session.client_id.as_deref(), Some("stored"));
        assert_eq!(saved.subscriptions.topics, vec!["x/y"]);
        assert_eq!(saved.subscriptions.qos, vec![2]);
        assert!(saved.broadcast);
        assert!(saved.auto_start);
        assert!(h.manager.auto_start());
    }

    fn seeded_store() -> Arc<MemoryConfigStore> {
        let mut seeded = StoredSettings::default();
        seeded.set_session(&Session::new("persisted", "mqtt://persisted:1883"));
        seeded.set_subscriptions(&[Subscription::new("keep/me", QoS::AtLeastOnce)]);
        seeded.auto_start = true;
        seeded.broadcast = true;
        Arc::new(MemoryConfigStore::new(seeded))
    }

    #[tokio::test]
    async fn test_first_write_through_keeps_stored_settings() {
        let store = seeded_store();
        let manager = SessionManager::builder(Arc::new(MockTransport::new()))
            .wake_timer(Arc::new(MockWakeTimer::new()))
            .store(store.clone())
            .build();
        assert!(manager.broadcast_enabled());

        manager.set_auto_start(false);

        let saved = store.current();
        assert!(!saved.auto_start);
        assert!(saved.broadcast);
        assert_eq!(saved.session.client_id.as_deref(), Some("persisted"));
        assert_eq!(saved.subscriptions.topics, vec!["keep/me"]);
        assert_eq!(saved.subscriptions.qos, vec![1]);
    }

    #[tokio::test]
    async fn test_builder_values_are_folded_into_the_store() {
        let store = seeded_store();
        let h = harness(|b| {
            b.subscriptions(vec![Subscription::new("from/builder", QoS::ExactlyOnce)])
                .store(store.clone())
        });

        h.manager.set_broadcast(false);

        let saved = store.current();
        assert!(saved.auto_start);
        assert!(!saved.broadcast);
        assert_eq!(saved.session.client_id.as_deref(), Some("unit-client"));
        assert_eq!(saved.session.server_uri.as_deref(), Some("mqtt://localhost:1883"));
        assert_eq!(saved.subscriptions.topics, vec!["from/builder"]);
        assert_eq!(saved.subscriptions.qos, vec![2]);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let h = harness(|b| b);
        h.manager.connect().await.unwrap();
        wait_for_state(&h.manager, ConnectionState::Connected).await;

        h.manager.close().await.unwrap();
        h.manager.close().await.unwrap();

        assert_eq!(h.manager.state(), ConnectionState::Closed);
        assert!(!h.manager.keepalive_running());
        assert!(matches!(h.manager.connect().await, Err(SessionError::Closed)));
        assert!(matches!(
            h.manager.publish(OutboundMessage::new("a", "b")).await,
            Err(SessionError::Closed)
        ));
        assert!(h.manager.disconnect().await.is_ok());
        assert_eq!(
            h.transport.calls().iter().filter(|c| **c == TransportCall::Close).count(),
            1
        );
    }
}
