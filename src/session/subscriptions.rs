//! Desired subscription set and its replay after every (re)connect

use super::model::{QoS, Subscription};
use crate::transport::Transport;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Outcome of one replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub topics: Vec<String>,
    pub unsubscribe_ok: bool,
    pub subscribe_ok: bool,
}

/// Authoritative list of (topic, QoS) the session wants active
///
/// Ordered by first insertion; re-subscribing an existing topic replaces its
/// QoS in place. Changes are durable immediately, whatever the connection
/// state.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    desired: Mutex<Vec<Subscription>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from parallel topic/QoS lists as they are persisted
    ///
    /// When the lists disagree in length, or any QoS is out of range, every
    /// topic falls back to QoS 0.
    pub fn pair_lists(topics: &[String], qos: &[u8]) -> Vec<Subscription> {
        let parsed: Option<Vec<QoS>> = if qos.len() == topics.len() {
            qos.iter().map(|level| QoS::try_from(*level).ok()).collect()
        } else {
            None
        };
        if parsed.is_none() && !topics.is_empty() {
            warn!(
                topics = topics.len(),
                qos_levels = qos.len(),
                "QoS list does not match topics, defaulting every topic to QoS 0"
            );
        }
        let levels = parsed.unwrap_or_else(|| vec![QoS::AtMostOnce; topics.len()]);

        topics
            .iter()
            .zip(levels)
            .filter(|(topic, _)| !topic.trim().is_empty())
            .map(|(topic, qos)| Subscription::new(topic.clone(), qos))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.desired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or update a topic; returns true when the set changed
    pub fn subscribe(&self, topic: impl Into<String>, qos: QoS) -> bool {
        let topic = topic.into();
        let mut desired = self.lock();
        match desired.iter_mut().find(|s| s.topic == topic) {
            Some(existing) if existing.qos == qos => false,
            Some(existing) => {
                existing.qos = qos;
                true
            }
            None => {
                desired.push(Subscription::new(topic, qos));
                true
            }
        }
    }

    /// Remove a topic; returns true when it was present
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let mut desired = self.lock();
        let before = desired.len();
        desired.retain(|s| s.topic != topic);
        desired.len() != before
    }

    /// Replace the whole set, keeping last-write-wins on duplicate topics
    pub fn replace_all(&self, subscriptions: impl IntoIterator<Item = Subscription>) {
        let mut next: Vec<Subscription> = Vec::new();
        for subscription in subscriptions {
            match next.iter_mut().find(|s| s.topic == subscription.topic) {
                Some(existing) => existing.qos = subscription.qos,
                None => next.push(subscription),
            }
        }
        *self.lock() = next;
    }

    /// Snapshot of the desired set
    pub fn desired(&self) -> Vec<Subscription> {
        self.lock().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.lock().iter().map(|s| s.topic.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Unsubscribe then resubscribe the full desired set, one batch each
    ///
    /// Failures are logged and left for the next reconnect's replay.
    pub async fn replay(&self, transport: &dyn Transport) -> ReplayReport {
        let snapshot = self.desired();
        if snapshot.is_empty() {
            debug!("no subscriptions to replay");
            return ReplayReport {
                unsubscribe_ok: true,
                subscribe_ok: true,
                ..Default::default()
            };
        }
        let topics: Vec<String> = snapshot.iter().map(|s| s.topic.clone()).collect();

        let unsubscribe_ok = match transport.unsubscribe(&topics).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to clear stale subscriptions before replay");
                false
            }
        };

        let subscribe_ok = match transport.subscribe(&snapshot).await {
            Ok(()) => {
                info!(count = snapshot.len(), "Replayed subscriptions");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to replay subscriptions, will retry on next connect");
                false
            }
        };

        ReplayReport {
            topics,
            unsubscribe_ok,
            subscribe_ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockTransport, TransportCall};

    #[test]
    fn test_subscribe_last_write_wins_in_place() {
        let manager = SubscriptionManager::new();
        assert!(manager.subscribe("a/b", QoS::AtMostOnce));
        assert!(manager.subscribe("c/d", QoS::AtLeastOnce));
        assert!(manager.subscribe("a/b", QoS::ExactlyOnce));
        assert!(!manager.subscribe("a/b", QoS::ExactlyOnce));

        assert_eq!(
            manager.desired(),
            vec![
                Subscription::new("a/b", QoS::ExactlyOnce),
                Subscription::new("c/d", QoS::AtLeastOnce),
            ]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let manager = SubscriptionManager::new();
        manager.subscribe("a/b", QoS::AtLeastOnce);
        assert!(manager.unsubscribe("a/b"));
        assert!(!manager.unsubscribe("a/b"));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_pair_lists_matching_lengths() {
        let topics = vec!["a".to_string(), "b".to_string()];
        let pairs = SubscriptionManager::pair_lists(&topics, &[1, 2]);
        assert_eq!(
            pairs,
            vec![
                Subscription::new("a", QoS::AtLeastOnce),
                Subscription::new("b", QoS::ExactlyOnce),
            ]
        );
    }

    #[test]
    fn test_pair_lists_mismatch_defaults_to_qos0() {
        let topics = vec!["a".to_string(), "b".to_string()];
        for qos in [&[1u8][..], &[][..], &[1, 7][..]] {
            let pairs = SubscriptionManager::pair_lists(&topics, qos);
            assert!(pairs.iter().all(|s| s.qos == QoS::AtMostOnce), "qos list {qos:?}");
            assert_eq!(pairs.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_replay_issues_one_batch_each_direction() {
        let transport = MockTransport::new();
        let manager = SubscriptionManager::new();
        manager.subscribe("a/b", QoS::AtLeastOnce);
        manager.subscribe("c/#", QoS::AtMostOnce);

        let report = manager.replay(&transport).await;

        assert!(report.unsubscribe_ok && report.subscribe_ok);
        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::Unsubscribe(vec!["a/b".to_string(), "c/#".to_string()]),
                TransportCall::Subscribe(manager.desired()),
            ]
        );
    }

    #[tokio::test]
    async fn test_replay_failure_is_reported_not_retried() {
        let transport = MockTransport::new();
        transport.fail_subscribe(true);
        let manager = SubscriptionManager::new();
        manager.subscribe("a/b", QoS::AtLeastOnce);

        let report = manager.replay(&transport).await;

        assert!(report.unsubscribe_ok);
        assert!(!report.subscribe_ok);
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_replay_empty_set_touches_nothing() {
        let transport = MockTransport::new();
        let report = SubscriptionManager::new().replay(&transport).await;
        assert!(report.topics.is_empty());
        assert!(transport.calls().is_empty());
    }
}
