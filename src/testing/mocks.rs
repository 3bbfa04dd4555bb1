//! Mock implementations for testing
//!
//! Provides a scripted Transport, a manually fired wake timer, a counting
//! wake lock and a recording session listener, so the session can be
//! exercised without a broker or real timers.

use crate::session::keepalive::{PingToken, WakeCallback, WakeHandle, WakeLock, WakeTimer};
use crate::session::manager::SessionListener;
use crate::session::model::{
    DeliveryOutcome, DeliveryToken, InboundMessage, OutboundMessage, QoS, Session, Subscription,
};
use crate::transport::{Transport, TransportError, TransportEvent, TransportListener};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded call into [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Connect { client_id: String },
    Disconnect,
    Close,
    Subscribe(Vec<Subscription>),
    Unsubscribe(Vec<String>),
    Publish(OutboundMessage),
}

/// Scripted result for the next `connect`
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    /// Emit ConnectSuccess
    Succeed,
    /// Emit ConnectFailure with this reason
    Fail(String),
    /// Return an error from `connect` itself
    Reject(String),
    /// Emit nothing; the attempt stays in flight
    Hang,
}

/// Mock transport for testing
#[derive(Debug, Default)]
pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
    connect_times: Mutex<Vec<tokio::time::Instant>>,
    script: Mutex<VecDeque<ConnectOutcome>>,
    listener: Mutex<Option<TransportListener>>,
    connected: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
    hold_deliveries: AtomicBool,
    hold_disconnect: AtomicBool,
    idle: AtomicBool,
    next_token: AtomicU64,
    activity_checks: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for upcoming connects; an empty script succeeds
    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        lock(&self.script).extend(outcomes);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Stop auto-completing deliveries
    pub fn hold_deliveries(&self, hold: bool) {
        self.hold_deliveries.store(hold, Ordering::SeqCst);
    }

    /// Stop auto-completing disconnects
    pub fn hold_disconnect(&self, hold: bool) {
        self.hold_disconnect.store(hold, Ordering::SeqCst);
    }

    /// Make `check_for_activity` report an idle link
    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, TransportCall::Connect { .. }))
            .count()
    }

    /// Tokio clock readings at each `connect`
    pub fn connect_times(&self) -> Vec<tokio::time::Instant> {
        lock(&self.connect_times).clone()
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                TransportCall::Publish(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn activity_checks(&self) -> usize {
        self.activity_checks.load(Ordering::SeqCst)
    }

    /// Push an event to the current listener; false when nobody is listening
    pub fn emit(&self, event: TransportEvent) -> bool {
        match lock(&self.listener).as_ref() {
            Some(listener) => listener.send(event).is_ok(),
            None => false,
        }
    }

    /// Simulate the broker dropping the link
    pub fn drop_connection(&self, cause: &str) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::ConnectionLost {
            cause: cause.to_string(),
        })
    }

    /// Simulate an inbound publish
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        self.emit(TransportEvent::MessageArrived(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: QoS::AtMostOnce,
            retained: false,
        }))
    }

    fn record(&self, call: TransportCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        session: &Session,
        listener: TransportListener,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Connect {
            client_id: session.client_id.clone(),
        });
        lock(&self.connect_times).push(tokio::time::Instant::now());
        *lock(&self.listener) = Some(listener.clone());

        let outcome = lock(&self.script)
            .pop_front()
            .unwrap_or(ConnectOutcome::Succeed);
        match outcome {
            ConnectOutcome::Succeed => {
                self.connected.store(true, Ordering::SeqCst);
                let _ = listener.send(TransportEvent::ConnectSuccess {
                    server_uri: session.server_uri.clone(),
                });
            }
            ConnectOutcome::Fail(reason) => {
                let _ = listener.send(TransportEvent::ConnectFailure { reason });
            }
            ConnectOutcome::Reject(reason) => {
                return Err(TransportError::ConnectionFailed(reason));
            }
            ConnectOutcome::Hang => {}
        }
        Ok(())
    }

    async fn disconnect(&self, listener: TransportListener) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect);
        self.connected.store(false, Ordering::SeqCst);
        if !self.hold_disconnect.load(Ordering::SeqCst) {
            let _ = listener.send(TransportEvent::DisconnectComplete);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(TransportCall::Close);
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.listener).take();
        Ok(())
    }

    async fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        self.record(TransportCall::Subscribe(subscriptions.to_vec()));
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::SubscriptionFailed(
                "mock subscribe failure".to_string().into(),
            ));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        self.record(TransportCall::Unsubscribe(topics.to_vec()));
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<DeliveryToken, TransportError> {
        self.record(TransportCall::Publish(message.clone()));
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed(
                "mock publish failure".to_string().into(),
            ));
        }
        let token = DeliveryToken(self.next_token.fetch_add(1, Ordering::SeqCst) + 1);
        if !self.hold_deliveries.load(Ordering::SeqCst) {
            self.emit(TransportEvent::DeliveryComplete {
                token,
                outcome: DeliveryOutcome::Delivered,
            });
        }
        Ok(token)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn check_for_activity(&self) -> Option<PingToken> {
        self.activity_checks.fetch_add(1, Ordering::SeqCst);
        if !self.idle.load(Ordering::SeqCst) {
            return None;
        }
        let (completer, token) = PingToken::pair();
        completer.complete(Ok(()));
        Some(token)
    }
}

struct ArmedWake {
    handle: WakeHandle,
    at: SystemTime,
    wake: WakeCallback,
}

/// Wake timer that only fires when the test says so
#[derive(Default)]
pub struct MockWakeTimer {
    next_id: AtomicU64,
    armed: Mutex<Vec<ArmedWake>>,
    cancelled: AtomicUsize,
}

impl std::fmt::Debug for MockWakeTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockWakeTimer")
            .field("armed", &self.armed())
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

impl MockWakeTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed(&self) -> usize {
        lock(&self.armed).len()
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<SystemTime> {
        lock(&self.armed).iter().map(|w| w.at).min()
    }

    /// Remove the earliest wake-up without running it
    pub fn take_next(&self) -> Option<WakeCallback> {
        let mut armed = lock(&self.armed);
        let index = armed
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.at)
            .map(|(i, _)| i)?;
        Some(armed.remove(index).wake)
    }

    /// Run the earliest wake-up; false when nothing is armed
    pub fn fire_next(&self) -> bool {
        // The callback re-arms through `schedule`, so the lock is released first
        match self.take_next() {
            Some(wake) => {
                wake();
                true
            }
            None => false,
        }
    }
}

impl WakeTimer for MockWakeTimer {
    fn schedule(&self, at: SystemTime, wake: WakeCallback) -> WakeHandle {
        let handle = WakeHandle(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.armed).push(ArmedWake { handle, at, wake });
        handle
    }

    fn cancel(&self, handle: WakeHandle) {
        let mut armed = lock(&self.armed);
        let before = armed.len();
        armed.retain(|w| w.handle != handle);
        if armed.len() != before {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Wake lock that counts acquire/release pairs
#[derive(Debug, Default)]
pub struct MockWakeLock {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl MockWakeLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> bool {
        self.acquired() > self.released()
    }
}

impl WakeLock for MockWakeLock {
    fn acquire(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// One callback observed by [`RecordingListener`]
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Connected,
    ConnectionLost(String),
    Message { topic: String, payload: Vec<u8> },
    Delivery(DeliveryToken, DeliveryOutcome),
}

/// Session listener that keeps every callback for later assertions
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, matches: impl Fn(&ListenerEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| matches(e)).count()
    }

    /// Poll until `predicate` holds or `timeout` elapses on the tokio clock
    pub async fn wait_until(
        &self,
        timeout: Duration,
        predicate: impl Fn(&[ListenerEvent]) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&lock(&self.events)) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn push(&self, event: ListenerEvent) {
        lock(&self.events).push(event);
    }
}

impl SessionListener for RecordingListener {
    fn on_connected(&self) {
        self.push(ListenerEvent::Connected);
    }

    fn on_connection_lost(&self, cause: &str) {
        self.push(ListenerEvent::ConnectionLost(cause.to_string()));
    }

    fn on_message_received(&self, topic: &str, payload: &[u8]) {
        self.push(ListenerEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    fn on_delivery_complete(&self, token: DeliveryToken, outcome: &DeliveryOutcome) {
        self.push(ListenerEvent::Delivery(token, outcome.clone()));
    }
}
