//! MQTT connectivity tracking.
//!
//! Backs the per-Thing connectivity entities. Only real transitions are
//! published: repeated "still connected" or "still disconnected" signals
//! leave watchers untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Connected/disconnected flag with change notification.
#[derive(Debug)]
pub struct ConnectivityState {
    tx: watch::Sender<bool>,
    transitions: AtomicU64,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityState {
    /// Create a state that starts disconnected.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx,
            transitions: AtomicU64::new(0),
        }
    }

    /// Set the flag. Returns `true` if this was a transition.
    pub fn set(&self, connected: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
        if changed {
            self.transitions.fetch_add(1, Ordering::Relaxed);
            tracing::info!(connected, "MQTT connectivity changed");
        }
        changed
    }

    /// Record a successful (re)connection.
    pub fn mark_connected(&self) -> bool {
        self.set(true)
    }

    /// Record a lost or closed connection.
    pub fn mark_disconnected(&self) -> bool {
        self.set(false)
    }

    /// Current flag.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    /// Watch transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Number of transitions observed so far.
    #[must_use]
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        let state = ConnectivityState::new();
        assert!(!state.is_connected());
        assert_eq!(state.transitions(), 0);
        assert!(!state.mark_disconnected());
    }

    #[test]
    fn repeated_connected_signals_transition_once() {
        let state = ConnectivityState::new();
        let mut rx = state.subscribe();

        assert!(state.mark_connected());
        assert!(!state.mark_connected());
        assert!(!state.mark_connected());

        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(!rx.has_changed().unwrap());
        assert_eq!(state.transitions(), 1);
    }

    #[test]
    fn drop_and_reconnect() {
        let state = ConnectivityState::new();
        let mut rx = state.subscribe();

        state.mark_connected();
        rx.borrow_and_update();

        assert!(state.mark_disconnected());
        assert!(!*rx.borrow_and_update());

        assert!(state.mark_connected());
        assert!(!state.mark_connected());
        assert!(*rx.borrow_and_update());

        assert_eq!(state.transitions(), 3);
    }

    #[tokio::test]
    async fn watcher_wakes_on_transition() {
        let state = ConnectivityState::new();
        let mut rx = state.subscribe();

        let waiter = tokio::spawn(async move {
            rx.changed().await.unwrap();
            *rx.borrow()
        });

        state.mark_connected();
        assert!(waiter.await.unwrap());
    }
}
