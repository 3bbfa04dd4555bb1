//! Per-session metrics
//!
//! Atomic counters for connection churn and message flow, owned by one
//! `SessionManager` and rendered into a serialisable [`MetricsSnapshot`].

use crate::session::state::ConnectionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Thread-safe counters for one session
#[derive(Debug)]
pub struct SessionMetrics {
    connected: AtomicBool,
    connect_attempts: AtomicU64,
    connections_established: AtomicU64,
    connect_failures: AtomicU64,
    connections_lost: AtomicU64,
    connection_start_time: AtomicU64,

    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    deliveries_completed: AtomicU64,
    delivery_failures: AtomicU64,

    last_failure_at: Mutex<Option<DateTime<Utc>>>,
    uptime_start: AtomicU64,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            deliveries_completed: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            last_failure_at: Mutex::new(None),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Connection metrics
    pub fn connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connect_failed(&self, at: DateTime<Utc>) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        self.mark_down(at);
    }

    pub fn connection_lost(&self, at: DateTime<Utc>) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.mark_down(at);
    }

    /// Link went down without a failure (orderly disconnect or close)
    pub fn connection_closed(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    fn mark_down(&self, at: DateTime<Utc>) {
        self.connection_closed();
        *self
            .last_failure_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    // Message metrics
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_completed(&self, delivered: bool) {
        if delivered {
            self.deliveries_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        *self
            .last_failure_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    /// Build a snapshot; state owned elsewhere is passed in by the manager
    pub fn snapshot(
        &self,
        state: ConnectionState,
        reconnect_count: u32,
        dispatch: DispatchMetrics,
        keepalive_wakeups: u64,
    ) -> MetricsSnapshot {
        let now = current_timestamp();

        MetricsSnapshot {
            state: state.to_string(),
            reconnect_count,
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connect_failures: self.connect_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                last_failure_at: self.last_failure_at(),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                deliveries_completed: self.deliveries_completed.load(Ordering::Relaxed),
                delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            },
            dispatch,
            keepalive_wakeups,
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub state: String,
    pub reconnect_count: u32,
    pub connection: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub dispatch: DispatchMetrics,
    pub keepalive_wakeups: u64,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connect_attempts: u64,
    pub connections_established: u64,
    pub connect_failures: u64,
    pub connections_lost: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageMetrics {
    pub received: u64,
    /// Arrived outside the Connected state or after the pool stopped
    pub dropped: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub deliveries_completed: u64,
    pub delivery_failures: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchMetrics {
    pub workers: usize,
    pub pending: usize,
    pub completed: u64,
    pub failed: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_connection_metrics() {
        let metrics = SessionMetrics::new();

        metrics.connect_attempt();
        metrics.connect_failed(Utc::now());
        metrics.connect_attempt();
        metrics.connection_established();

        let snapshot =
            metrics.snapshot(ConnectionState::Connected, 0, DispatchMetrics::default(), 0);
        assert_eq!(snapshot.state, "connected");
        assert_eq!(snapshot.connection.connect_attempts, 2);
        assert_eq!(snapshot.connection.connect_failures, 1);
        assert_eq!(snapshot.connection.connections_established, 1);
        assert!(snapshot.connection.connected);
        assert!(snapshot.connection.last_failure_at.is_some());
    }

    #[test]
    fn test_connection_lost_marks_down() {
        let metrics = SessionMetrics::new();
        metrics.connection_established();
        metrics.connection_lost(Utc::now());

        let snapshot =
            metrics.snapshot(ConnectionState::Disconnected, 1, DispatchMetrics::default(), 0);
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.connection.connections_lost, 1);
        assert_eq!(snapshot.connection.connection_duration_seconds, 0);
        assert_eq!(snapshot.reconnect_count, 1);
    }

    #[test]
    fn test_delivery_outcomes_are_split() {
        let metrics = SessionMetrics::new();
        metrics.delivery_completed(true);
        metrics.delivery_completed(true);
        metrics.delivery_completed(false);

        let snapshot =
            metrics.snapshot(ConnectionState::Connected, 0, DispatchMetrics::default(), 0);
        assert_eq!(snapshot.messages.deliveries_completed, 2);
        assert_eq!(snapshot.messages.delivery_failures, 1);
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(SessionMetrics::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.message_received();
                        metrics.message_published();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot =
            metrics.snapshot(ConnectionState::Connected, 0, DispatchMetrics::default(), 0);
        assert_eq!(snapshot.messages.received, 1000);
        assert_eq!(snapshot.messages.published, 1000);
    }

    #[test]
    fn test_snapshot_serialises() {
        let metrics = SessionMetrics::new();
        let snapshot = metrics.snapshot(
            ConnectionState::Disconnected,
            0,
            DispatchMetrics {
                workers: 3,
                ..Default::default()
            },
            7,
        );
        let rendered = serde_json::to_string(&snapshot).unwrap();
        assert!(rendered.contains("\"state\":\"disconnected\""));
        assert!(rendered.contains("\"keepalive_wakeups\":7"));
    }
}
