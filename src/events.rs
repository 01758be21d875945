//! Refresh bus — broadcast signal that tells registry instances to re-pull
//! the thread list from the store.
//!
//! Any component may emit; every subscribed registry re-runs its fetch. The
//! bus is backed by a `tokio::sync::broadcast::channel` so multiple
//! subscribers can consume the same signal without blocking the sender.

use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Refresh signals are coalescable —
/// a lagging consumer that skips old ones loses nothing.
const BUS_CAPACITY: usize = 16;

/// The parameterless refresh signal.
#[derive(Debug, Clone, Copy)]
pub struct Refresh;

/// Shared broadcast bus for refresh signals.
///
/// Clone cheaply — the underlying `broadcast::Sender` is Arc-backed.
#[derive(Clone)]
pub struct RefreshBus {
    sender: broadcast::Sender<Refresh>,
}

impl RefreshBus {
    /// Create a new bus with the standard capacity.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the refresh stream.
    ///
    /// The returned receiver sees signals emitted AFTER the call to
    /// `subscribe()`; earlier signals are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Refresh> {
        self.sender.subscribe()
    }

    /// Emit a refresh to all current subscribers.
    ///
    /// Silently drops the signal if there are no subscribers (no error).
    pub fn emit(&self) {
        // send() errors only when there are 0 subscribers — that's fine.
        let _ = self.sender.send(Refresh);
    }
}

impl Default for RefreshBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_every_subscriber() {
        let bus = RefreshBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit();
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());
    }

    #[test]
    fn emit_without_subscribers_is_a_no_op() {
        let bus = RefreshBus::new();
        bus.emit();
    }
}
