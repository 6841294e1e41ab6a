//! Gate connection gauge
//!
//! Counts gate devices currently holding a long-poll open. Entering returns a
//! guard; dropping the guard is the only way to leave, so every exit path of a
//! poll (response, timeout, shutdown, client disconnect dropping the request
//! future) releases its slot exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::error;

#[derive(Debug)]
pub struct GateConnectionTracker {
    capacity: usize,
    connected: AtomicUsize,
}

/// Slot held by one connected device, released on drop
#[must_use = "dropping the guard immediately releases the connection slot"]
pub struct ConnectionGuard<'a> {
    tracker: &'a GateConnectionTracker,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.tracker.exit();
    }
}

impl GateConnectionTracker {
    /// Create a tracker for at most `capacity` devices (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), connected: AtomicUsize::new(0) }
    }

    /// Register one connected device.
    ///
    /// Returns `None` without touching the count when the tracker is full.
    pub fn try_enter(&self) -> Option<ConnectionGuard<'_>> {
        self.connected
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.capacity).then_some(current + 1)
            })
            .ok()
            .map(|_| ConnectionGuard { tracker: self })
    }

    fn exit(&self) {
        let released = self.connected.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            current.checked_sub(1)
        });
        if released.is_err() {
            error!("gate_connection_count_underflow");
            debug_assert!(false, "gate connection released more often than entered");
        }
    }

    /// Number of devices currently connected
    pub fn count(&self) -> usize {
        self.connected.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether at least one gate device is connected right now
    pub fn is_reachable(&self) -> bool {
        self.count() > 0
    }
}
