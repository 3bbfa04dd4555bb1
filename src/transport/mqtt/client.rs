//! rumqttc-backed [`Transport`]
//!
//! Each `connect` spawns one driver task that owns a fresh `EventLoop`. The
//! driver tries the session's broker URIs in order, reports the outcome,
//! then routes events until the link fails. It never re-polls after an
//! error: rumqttc would reconnect on its own, and reconnecting belongs to
//! the session manager.

use super::events::{route_mqtt_event, DeliveryTracker, EventRoute};
use super::options::{configure_mqtt_options, parse_broker_uri, to_mqtt_filters, to_mqtt_qos};
use crate::error::sanitize_cause;
use crate::session::keepalive::{PingCompleter, PingToken};
use crate::session::model::{
    DeliveryOutcome, DeliveryToken, OutboundMessage, Session, Subscription,
};
use crate::transport::{Transport, TransportError, TransportEvent, TransportListener};
use crate::transport_span;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Request queue depth between AsyncClient and EventLoop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Grace period for the driver to flush DISCONNECT
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Driver {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Shared {
    client: Mutex<Option<AsyncClient>>,
    listener: Mutex<Option<TransportListener>>,
    connected: AtomicBool,
    disconnecting: AtomicBool,
    disconnect_reported: AtomicBool,
    closed: AtomicBool,
    deliveries: Mutex<DeliveryTracker>,
    ping_waiters: Mutex<Vec<PingCompleter>>,
    /// Wall clock, so time spent suspended counts as idle
    last_incoming: Mutex<SystemTime>,
    keep_alive: Mutex<Duration>,
    next_token: AtomicU64,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if let Some(listener) = lock(&self.listener).as_ref() {
            if listener.send(event).is_err() {
                debug!(target: "mqtt_session", "transport listener dropped");
            }
        }
    }

    /// DisconnectComplete is sent at most once per disconnect
    fn report_disconnected(&self) {
        if !self.disconnect_reported.swap(true, Ordering::SeqCst) {
            self.emit(TransportEvent::DisconnectComplete);
        }
    }

    fn touch(&self) {
        *lock(&self.last_incoming) = SystemTime::now();
        for waiter in lock(&self.ping_waiters).drain(..) {
            waiter.complete(Ok(()));
        }
    }

    /// Fail everything that depended on the link
    fn fail_pending(&self, reason: &str) {
        for waiter in lock(&self.ping_waiters).drain(..) {
            waiter.complete(Err(reason.to_string()));
        }
        let tokens = lock(&self.deliveries).drain();
        for token in tokens {
            self.emit(TransportEvent::DeliveryComplete {
                token,
                outcome: DeliveryOutcome::Failed(reason.to_string()),
            });
        }
    }

    fn link_down(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.client).take();
    }
}

/// MQTT v5 transport over rumqttc
pub struct MqttTransport {
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("connected", &self.shared.connected.load(Ordering::SeqCst))
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                client: Mutex::new(None),
                listener: Mutex::new(None),
                connected: AtomicBool::new(false),
                disconnecting: AtomicBool::new(false),
                disconnect_reported: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                deliveries: Mutex::new(DeliveryTracker::default()),
                ping_waiters: Mutex::new(Vec::new()),
                last_incoming: Mutex::new(SystemTime::now()),
                keep_alive: Mutex::new(Duration::from_secs(
                    crate::session::model::DEFAULT_KEEP_ALIVE_SECS,
                )),
                next_token: AtomicU64::new(0),
            }),
            driver: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        lock(&self.shared.client)
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn stop_driver(&self) {
        if let Some(driver) = lock(&self.driver).take() {
            let _ = driver.shutdown.send(true);
            driver.task.abort();
        }
    }

    /// Try each URI until one acknowledges, then route events until failure
    async fn drive(
        shared: Arc<Shared>,
        session: Session,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut failures = Vec::new();

        for uri in session.server_uris() {
            if *shutdown.borrow() || shared.disconnecting.load(Ordering::SeqCst) {
                return;
            }
            let options = match configure_mqtt_options(&session, uri) {
                Ok(options) => options,
                Err(e) => {
                    failures.push(format!("{uri}: {e}"));
                    continue;
                }
            };
            let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
            debug!(target: "mqtt_session", uri, "connecting to broker");

            let acknowledged = tokio::select! {
                _ = shutdown.changed() => return,
                result = tokio::time::timeout(
                    session.connection_timeout,
                    Self::wait_for_connack(&mut event_loop),
                ) => result,
            };

            match acknowledged {
                Ok(Ok(())) => {
                    *lock(&shared.client) = Some(client);
                    shared.connected.store(true, Ordering::SeqCst);
                    shared.touch();
                    info!(target: "mqtt_session", uri, "broker acknowledged connection");
                    shared.emit(TransportEvent::ConnectSuccess {
                        server_uri: uri.to_string(),
                    });
                    Self::route_events(&shared, &mut event_loop, &mut shutdown).await;
                    return;
                }
                Ok(Err(reason)) => failures.push(format!("{uri}: {reason}")),
                Err(_) => failures.push(format!(
                    "{uri}: no CONNACK within {}s",
                    session.connection_timeout.as_secs()
                )),
            }
        }

        let reason = if failures.is_empty() {
            "no broker URI configured".to_string()
        } else {
            failures.join("; ")
        };
        warn!(target: "mqtt_session", reason = %sanitize_cause(&reason), "all brokers failed");
        if shared.disconnecting.load(Ordering::SeqCst) {
            shared.report_disconnected();
        } else {
            shared.emit(TransportEvent::ConnectFailure { reason });
        }
    }

    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), String> {
        loop {
            match event_loop.poll().await {
                Ok(event) => {
                    if route_mqtt_event(&event) == EventRoute::ConnectionAcknowledged {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    async fn route_events(
        shared: &Arc<Shared>,
        event_loop: &mut EventLoop,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => return,
                event = event_loop.poll() => event,
            };

            let route = match event {
                Ok(event) => route_mqtt_event(&event),
                Err(e) => {
                    shared.link_down();
                    let cause = e.to_string();
                    shared.fail_pending(&cause);
                    if shared.disconnecting.load(Ordering::SeqCst) {
                        shared.report_disconnected();
                    } else {
                        shared.emit(TransportEvent::ConnectionLost { cause });
                    }
                    return;
                }
            };
            if route.is_incoming() {
                shared.touch();
            }

            match route {
                EventRoute::MessageReceived(message) => {
                    shared.emit(TransportEvent::MessageArrived(message));
                }
                EventRoute::PublishSent(pkid) => {
                    let done = lock(&shared.deliveries).on_publish_sent(pkid);
                    if let Some(token) = done {
                        shared.emit(TransportEvent::DeliveryComplete {
                            token,
                            outcome: DeliveryOutcome::Delivered,
                        });
                    }
                }
                EventRoute::PublishAcknowledged(pkid) => {
                    let done = lock(&shared.deliveries).on_acknowledged(pkid);
                    if let Some(token) = done {
                        shared.emit(TransportEvent::DeliveryComplete {
                            token,
                            outcome: DeliveryOutcome::Delivered,
                        });
                    }
                }
                EventRoute::BrokerDisconnect(cause) => {
                    shared.link_down();
                    shared.fail_pending(&cause);
                    if shared.disconnecting.load(Ordering::SeqCst) {
                        shared.report_disconnected();
                    } else {
                        shared.emit(TransportEvent::ConnectionLost { cause });
                    }
                    return;
                }
                EventRoute::DisconnectSent => {
                    shared.link_down();
                    shared.fail_pending("disconnected");
                    shared.report_disconnected();
                    return;
                }
                EventRoute::PingResponse => {
                    debug!(target: "mqtt_session", "PINGRESP received");
                }
                EventRoute::ConnectionAcknowledged
                | EventRoute::InfrastructureEvent
                | EventRoute::OutgoingEvent => {}
            }
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.stop_driver();
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &self,
        session: &Session,
        listener: TransportListener,
    ) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        for uri in session.server_uris() {
            parse_broker_uri(uri)?;
        }

        self.stop_driver();
        self.shared.link_down();
        *lock(&self.shared.listener) = Some(listener);
        *lock(&self.shared.keep_alive) = session.keep_alive;
        self.shared.disconnecting.store(false, Ordering::SeqCst);
        self.shared.disconnect_reported.store(false, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(
            Self::drive(self.shared.clone(), session.clone(), shutdown_rx)
                .instrument(transport_span!(client_id = %session.client_id)),
        );
        *lock(&self.driver) = Some(Driver {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    async fn disconnect(&self, listener: TransportListener) -> Result<(), TransportError> {
        *lock(&self.shared.listener) = Some(listener);
        self.shared.disconnecting.store(true, Ordering::SeqCst);

        let client = lock(&self.shared.client).clone();
        let Some(client) = client else {
            // Still connecting or already down: nothing to flush
            self.stop_driver();
            self.shared.link_down();
            self.shared.report_disconnected();
            return Ok(());
        };

        if let Err(e) = client.disconnect().await {
            warn!(target: "mqtt_session", error = %e, "DISCONNECT could not be queued");
            self.stop_driver();
            self.shared.link_down();
            self.shared.report_disconnected();
            return Ok(());
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_TIMEOUT).await;
            if !shared.disconnect_reported.load(Ordering::SeqCst) {
                warn!(target: "mqtt_session", "DISCONNECT not flushed in time");
                shared.link_down();
                shared.report_disconnected();
            }
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        let client = lock(&self.shared.client).clone();
        if let Some(client) = client {
            if let Err(e) = client.try_disconnect() {
                debug!(target: "mqtt_session", error = %e, "DISCONNECT skipped on close");
            }
        }
        self.stop_driver();
        self.shared.link_down();
        self.shared.fail_pending("transport closed");
        lock(&self.shared.listener).take();
        Ok(())
    }

    async fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        let client = self.client()?;
        if subscriptions.is_empty() {
            return Ok(());
        }
        client
            .subscribe_many(to_mqtt_filters(subscriptions))
            .await
            .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))?;
        debug!(target: "mqtt_session", topics = subscriptions.len(), "SUBSCRIBE queued");
        Ok(())
    }

    /// One UNSUBSCRIBE per topic; a failed topic does not stop the rest
    async fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        let client = self.client()?;
        let mut first_error = None;
        for topic in topics {
            if let Err(e) = client.unsubscribe(topic.clone()).await {
                warn!(target: "mqtt_session", topic = %topic, error = %e, "UNSUBSCRIBE not queued");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(TransportError::UnsubscribeFailed(Box::new(e))),
            None => Ok(()),
        }
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<DeliveryToken, TransportError> {
        let client = self.client()?;
        let token = DeliveryToken(self.shared.next_token.fetch_add(1, Ordering::SeqCst) + 1);

        lock(&self.shared.deliveries).queue(token);
        let result = client
            .publish(
                message.topic.clone(),
                to_mqtt_qos(message.qos),
                message.retained,
                Bytes::from(message.payload.clone()),
            )
            .await;

        if let Err(e) = result {
            lock(&self.shared.deliveries).withdraw(token);
            return Err(TransportError::PublishFailed(Box::new(e)));
        }
        Ok(token)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn check_for_activity(&self) -> Option<PingToken> {
        if !self.is_connected() {
            return None;
        }
        let idle = SystemTime::now()
            .duration_since(*lock(&self.shared.last_incoming))
            .unwrap_or_default();
        let keep_alive = *lock(&self.shared.keep_alive);
        if idle < keep_alive / 2 {
            return None;
        }

        // rumqttc sends PINGREQ itself; the next incoming packet answers it
        let (completer, token) = PingToken::pair();
        lock(&self.shared.ping_waiters).push(completer);
        debug!(target: "mqtt_session", idle_secs = idle.as_secs(), "awaiting broker activity");
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::QoS;
    use rumqttc::v5::MqttOptions;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_operations_fail_without_connection() {
        let transport = MqttTransport::new();
        let message = OutboundMessage::new("a/b", "payload");

        assert!(matches!(
            transport.publish(&message).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.subscribe(&[Subscription::new("a/b", Default::default())]).await,
            Err(TransportError::NotConnected)
        ));
        assert!(!transport.is_connected());
        assert!(transport.check_for_activity().is_none());
    }

    #[tokio::test]
    async fn test_idle_time_spent_suspended_triggers_ping() {
        let transport = MqttTransport::new();
        transport.shared.connected.store(true, Ordering::SeqCst);
        *lock(&transport.shared.keep_alive) = Duration::from_secs(30);

        *lock(&transport.shared.last_incoming) = SystemTime::now();
        assert!(transport.check_for_activity().is_none());

        // Last packet seen before a 60 s suspension
        *lock(&transport.shared.last_incoming) = SystemTime::now() - Duration::from_secs(60);
        let token = transport.check_for_activity().expect("idle link needs a ping");

        transport.shared.touch();
        assert_eq!(token.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_subscriptions_go_out_as_one_request() {
        let transport = MqttTransport::new();
        // Room for one queued request and nothing draining it
        let options = MqttOptions::new("batch", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 1);
        *lock(&transport.shared.client) = Some(client);

        let subscriptions = [
            Subscription::new("a/b", QoS::AtMostOnce),
            Subscription::new("c/d", QoS::AtLeastOnce),
            Subscription::new("e/#", QoS::ExactlyOnce),
        ];
        let queued =
            tokio::time::timeout(Duration::from_secs(1), transport.subscribe(&subscriptions)).await;
        assert!(matches!(queued, Ok(Ok(()))));

        let empty = tokio::time::timeout(Duration::from_secs(1), transport.subscribe(&[])).await;
        assert!(matches!(empty, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_uri() {
        let transport = MqttTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new("bad-uri", "http://broker:1883");

        assert!(matches!(
            transport.connect(&session, tx).await,
            Err(TransportError::InvalidUri(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_reports_failure() {
        let transport = MqttTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new("unreachable", "mqtt://127.0.0.1:1");
        session.connection_timeout = Duration::from_secs(2);

        transport.connect(&session, tx).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("connect outcome")
            .expect("event");
        assert!(matches!(event, TransportEvent::ConnectFailure { .. }));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_completes() {
        let transport = MqttTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.disconnect(tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::DisconnectComplete));
    }

    #[tokio::test]
    async fn test_close_is_final() {
        let transport = MqttTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.close().await.unwrap();

        let session = Session::new("closed", "mqtt://localhost:1883");
        assert!(matches!(
            transport.connect(&session, tx).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            transport.publish(&OutboundMessage::new("a", "b")).await,
            Err(TransportError::Closed)
        ));
    }
}
