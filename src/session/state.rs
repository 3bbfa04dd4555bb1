//! Connection lifecycle state machine
//!
//! The transition table is a pure function over [`ConnectionState`] and
//! [`StateTrigger`]. [`ConnectionStateMachine`] applies it atomically under
//! the `watch` channel lock, so concurrent callers always observe a settled
//! state and two racing `connect()` calls collapse into one attempt.

use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle of the single logical broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Requests and transport callbacks that drive transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTrigger {
    Connect,
    ConnectSucceeded,
    ConnectFailed,
    ConnectionLost,
    Disconnect,
    DisconnectCompleted,
    Close,
}

/// Result of applying a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State moved
    Changed {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Trigger is idempotent in the current state
    Unchanged(ConnectionState),
    /// Trigger is not valid in the current state
    Rejected(ConnectionState),
}

impl Transition {
    pub fn is_changed(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }

    /// Target state if the transition happened
    pub fn entered(&self) -> Option<ConnectionState> {
        match self {
            Transition::Changed { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Pure transition table
pub fn next_state(current: ConnectionState, trigger: StateTrigger) -> Transition {
    use ConnectionState::*;
    use StateTrigger::*;

    let to = match (current, trigger) {
        (Closed, Close) => return Transition::Unchanged(current),
        (_, Close) => Closed,
        (Closed, _) => return Transition::Rejected(current),

        (Disconnected, Connect) => Connecting,
        (Connecting | Connected, Connect) => return Transition::Unchanged(current),

        (Connecting, ConnectSucceeded) => Connected,
        (Connecting, ConnectFailed) => Disconnected,
        (Connecting | Connected, ConnectionLost) => Disconnected,
        // Link dropped while we were already tearing it down
        (Disconnecting, ConnectionLost) => Closed,

        (Connecting | Connected, Disconnect) => Disconnecting,
        (Disconnected | Disconnecting, Disconnect) => return Transition::Unchanged(current),

        (Disconnecting, DisconnectCompleted) => Closed,

        _ => return Transition::Rejected(current),
    };

    Transition::Changed { from: current, to }
}

/// Single-writer owner of the [`ConnectionState`]
#[derive(Debug)]
pub struct ConnectionStateMachine {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    /// Current state snapshot
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Receiver that observes every settled state
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Apply a trigger atomically and report what happened
    pub fn apply(&self, trigger: StateTrigger) -> Transition {
        let mut outcome = Transition::Rejected(ConnectionState::Closed);
        self.tx.send_if_modified(|state| {
            outcome = next_state(*state, trigger);
            match outcome {
                Transition::Changed { to, .. } => {
                    *state = to;
                    true
                }
                _ => false,
            }
        });

        match outcome {
            Transition::Changed { from, to } => {
                info!(from = %from, to = %to, trigger = ?trigger, "Connection state changed");
            }
            Transition::Unchanged(state) => {
                debug!(state = %state, trigger = ?trigger, "State trigger ignored (no-op)");
            }
            Transition::Rejected(state) => {
                warn!(state = %state, trigger = ?trigger, "State trigger rejected");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ConnectionState::*;
    use StateTrigger::*;

    const ALL_STATES: [ConnectionState; 5] =
        [Disconnected, Connecting, Connected, Disconnecting, Closed];

    #[test]
    fn test_happy_path_transitions() {
        assert_eq!(
            next_state(Disconnected, Connect),
            Transition::Changed { from: Disconnected, to: Connecting }
        );
        assert_eq!(next_state(Connecting, ConnectSucceeded).entered(), Some(Connected));
        assert_eq!(next_state(Connecting, ConnectFailed).entered(), Some(Disconnected));
        assert_eq!(next_state(Connected, ConnectionLost).entered(), Some(Disconnected));
        assert_eq!(next_state(Connected, Disconnect).entered(), Some(Disconnecting));
        assert_eq!(next_state(Disconnecting, DisconnectCompleted).entered(), Some(Closed));
    }

    #[test]
    fn test_connect_is_noop_while_connecting_or_connected() {
        for state in [Connecting, Connected] {
            assert_eq!(next_state(state, Connect), Transition::Unchanged(state));
        }
    }

    #[test]
    fn test_disconnect_is_noop_when_already_down() {
        assert_eq!(next_state(Disconnected, Disconnect), Transition::Unchanged(Disconnected));
        assert_eq!(next_state(Disconnecting, Disconnect), Transition::Unchanged(Disconnecting));
        assert_eq!(next_state(Closed, Disconnect), Transition::Rejected(Closed));
    }

    #[test]
    fn test_close_from_any_state_is_terminal() {
        for state in ALL_STATES {
            let outcome = next_state(state, Close);
            if state == Closed {
                assert_eq!(outcome, Transition::Unchanged(Closed));
            } else {
                assert_eq!(outcome.entered(), Some(Closed));
            }
        }
        for trigger in [
            Connect,
            ConnectSucceeded,
            ConnectFailed,
            ConnectionLost,
            DisconnectCompleted,
        ] {
            assert!(!next_state(Closed, trigger).is_changed());
        }
    }

    #[test]
    fn test_stale_callbacks_are_rejected() {
        assert_eq!(
            next_state(Disconnecting, ConnectSucceeded),
            Transition::Rejected(Disconnecting)
        );
        assert_eq!(next_state(Disconnected, ConnectFailed), Transition::Rejected(Disconnected));
        assert_eq!(next_state(Connected, DisconnectCompleted), Transition::Rejected(Connected));
    }

    #[test]
    fn test_double_disconnect_yields_single_sequence() {
        let machine = ConnectionStateMachine::new();
        machine.apply(Connect);
        machine.apply(ConnectSucceeded);

        assert!(machine.apply(Disconnect).is_changed());
        assert_eq!(machine.apply(Disconnect), Transition::Unchanged(Disconnecting));
        assert_eq!(machine.apply(DisconnectCompleted).entered(), Some(Closed));
        assert_eq!(machine.current(), Closed);
    }

    #[test]
    fn test_concurrent_connects_collapse_into_one_attempt() {
        let machine = Arc::new(ConnectionStateMachine::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let machine = machine.clone();
                std::thread::spawn(move || machine.apply(Connect).is_changed())
            })
            .collect();

        let changed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|changed| *changed)
            .count();

        assert_eq!(changed, 1, "exactly one caller should start the attempt");
        assert_eq!(machine.current(), Connecting);
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let machine = ConnectionStateMachine::new();
        let mut rx = machine.subscribe();

        machine.apply(Connect);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connecting);
    }
}
