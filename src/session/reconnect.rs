//! Reconnect backoff policy
//!
//! Pure decision logic: given the failure streak and network reachability,
//! decide when the next connect attempt should happen. The caller owns the
//! timer; nothing here sleeps or spawns.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Failures tolerated before the delay jumps to the cap
pub const LINEAR_BACKOFF_ATTEMPTS: u32 = 5;

/// Delay added per consecutive failure during the linear phase
pub const BACKOFF_STEP: Duration = Duration::from_secs(5);

/// Delay used once the linear phase is exhausted
pub const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Consecutive failure bookkeeping for the current streak
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectAttempt {
    pub count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub network_available: bool,
}

impl Default for ReconnectAttempt {
    fn default() -> Self {
        Self {
            count: 0,
            last_failure_at: None,
            network_available: true,
        }
    }
}

impl ReconnectAttempt {
    /// Record one more failure in the streak
    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.count = self.count.saturating_add(1);
        self.last_failure_at = Some(at);
    }

    /// Streak ends on a successful connect
    pub fn reset(&mut self) {
        self.count = 0;
        self.last_failure_at = None;
    }
}

/// What the session should do after a failure or a network change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Connect right away
    Immediate,
    /// Arm a one-shot timer
    DelayedBy(Duration),
    /// Do not arm anything until the network comes back
    WaitForNetwork,
}

/// Monotone, capped linear backoff that defers to reachability
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconnectPolicy;

impl ReconnectPolicy {
    /// Decide the next action for a failure streak (pure function)
    pub fn next_action(&self, attempt: &ReconnectAttempt) -> ReconnectAction {
        if !attempt.network_available {
            return ReconnectAction::WaitForNetwork;
        }

        if attempt.count < LINEAR_BACKOFF_ATTEMPTS {
            ReconnectAction::DelayedBy(BACKOFF_STEP * attempt.count)
        } else {
            ReconnectAction::DelayedBy(BACKOFF_CAP)
        }
    }

    /// Decide what a reachability change means while disconnected (pure function)
    ///
    /// A restored network short-circuits any pending delay; a lost one
    /// parks the session until the next signal.
    pub fn on_network_change(&self, network_available: bool) -> ReconnectAction {
        if network_available {
            ReconnectAction::Immediate
        } else {
            ReconnectAction::WaitForNetwork
        }
    }
}
