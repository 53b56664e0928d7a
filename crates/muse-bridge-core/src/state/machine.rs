//! Connection state machine.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

use crate::protocol::constants::*;

/// Connection state as reported by the native SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    NeedsFirmwareUpdate,
    NeedsLicense,
    Unknown,
}

impl ConnectionState {
    /// Parse a native state code. Unrecognized codes yield `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            CONNECTION_CONNECTED => ConnectionState::Connected,
            CONNECTION_CONNECTING => ConnectionState::Connecting,
            CONNECTION_DISCONNECTED => ConnectionState::Disconnected,
            CONNECTION_NEEDS_UPDATE => ConnectionState::NeedsFirmwareUpdate,
            CONNECTION_NEEDS_LICENSE => ConnectionState::NeedsLicense,
            _ => ConnectionState::Unknown,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ConnectionState::Unknown => CONNECTION_UNKNOWN,
            ConnectionState::Connected => CONNECTION_CONNECTED,
            ConnectionState::Connecting => CONNECTION_CONNECTING,
            ConnectionState::Disconnected => CONNECTION_DISCONNECTED,
            ConnectionState::NeedsFirmwareUpdate => CONNECTION_NEEDS_UPDATE,
            ConnectionState::NeedsLicense => CONNECTION_NEEDS_LICENSE,
        }
    }

    /// The device refuses to stream until the user intervenes.
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            ConnectionState::NeedsFirmwareUpdate | ConnectionState::NeedsLicense
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::NeedsFirmwareUpdate => write!(f, "NEEDS_UPDATE"),
            ConnectionState::NeedsLicense => write!(f, "NEEDS_LICENSE"),
            ConnectionState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// An atomic `(previous, current)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

/// Current state of one session plus a watch channel for waiters.
///
/// Every update happens under one lock so the stored state and the order of
/// published transitions always agree.
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
    order: Mutex<()>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx,
            order: Mutex::new(()),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Record a transition reported by the native SDK.
    pub fn apply_reported<F>(&self, previous: ConnectionState, current: ConnectionState, publish: F)
    where
        F: FnOnce(Transition),
    {
        let _order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(from = %previous, to = %current, "State transition");
        self.tx.send_replace(current);
        publish(Transition { previous, current });
    }

    /// Force the state back to `Disconnected`.
    ///
    /// Publishes a transition only when the state actually changes.
    pub fn force_reset<F>(&self, publish: F) -> bool
    where
        F: FnOnce(Transition),
    {
        let _order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.current();
        if previous == ConnectionState::Disconnected {
            return false;
        }
        tracing::info!(from = %previous, to = %ConnectionState::Disconnected, "State reset");
        self.tx.send_replace(ConnectionState::Disconnected);
        publish(Transition {
            previous,
            current: ConnectionState::Disconnected,
        });
        true
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        assert_eq!(ConnectionState::from_code(1), ConnectionState::Connected);
        assert_eq!(ConnectionState::from_code(3), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::from_code(4), ConnectionState::NeedsFirmwareUpdate);
        assert_eq!(ConnectionState::from_code(99), ConnectionState::Unknown);
        assert_eq!(ConnectionState::NeedsLicense.code(), 5);
    }

    #[test]
    fn test_apply_reported_publishes_pair() {
        let cell = StateCell::new();
        let mut seen = Vec::new();
        cell.apply_reported(
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            |t| seen.push(t),
        );
        assert_eq!(cell.current(), ConnectionState::Connecting);
        assert_eq!(
            seen,
            vec![Transition {
                previous: ConnectionState::Disconnected,
                current: ConnectionState::Connecting,
            }]
        );
    }

    #[test]
    fn test_force_reset_is_silent_when_disconnected() {
        let cell = StateCell::new();
        let mut count = 0;
        assert!(!cell.force_reset(|_| count += 1));
        assert_eq!(count, 0);

        cell.apply_reported(ConnectionState::Disconnected, ConnectionState::Connecting, |_| {});
        assert!(cell.force_reset(|t| {
            assert_eq!(t.previous, ConnectionState::Connecting);
            count += 1;
        }));
        assert_eq!(count, 1);
        assert_eq!(cell.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_subscribe_sees_updates() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        cell.apply_reported(ConnectionState::Connecting, ConnectionState::Connected, |_| {});
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
    }
}
