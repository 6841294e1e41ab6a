//! Open signal - capacity-1 hand-off between open requests and gate polls
//!
//! Producers never block: a full slot means an open is already pending and the
//! new request collapses into it. Consumers queue on the receiver lock and race
//! the receive against the poll timeout and a cancellation future. Both the
//! lock and `mpsc::Receiver::recv` are cancel-safe, so a poll that loses the
//! race (timeout or cancel) leaves the token in the channel for the next poller.

use crate::domain::types::PollOutcome;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

pub struct OpenSignal {
    tx: mpsc::Sender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl Default for OpenSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenSignal {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self { tx, rx: Mutex::new(rx) }
    }

    /// Queue an open signal.
    ///
    /// Returns `true` if the signal was newly queued, `false` if one was
    /// already pending (no second token is created).
    pub fn try_open(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => {
                debug!("open_signal_queued");
                true
            }
            Err(TrySendError::Full(())) => {
                debug!("open_signal_already_pending");
                false
            }
            Err(TrySendError::Closed(())) => {
                // The receiver lives in `self`; a closed channel means the invariant is broken.
                error!("open_signal_channel_closed");
                panic!("open signal receiver dropped while the signal is alive");
            }
        }
    }

    /// Whether a signal is waiting to be consumed (display only)
    pub fn is_pending(&self) -> bool {
        self.tx.capacity() == 0
    }

    /// Wait for a signal, the timeout, or `cancel`, whichever resolves first.
    ///
    /// Exactly one of `Opened`, `TimedOut` or `Cancelled` is returned, and only
    /// `Opened` consumes the token. A cancel that has already fired wins over a
    /// ready token; a ready token wins over an elapsed timeout.
    pub async fn wait_or_timeout<C>(&self, timeout: Duration, cancel: C) -> PollOutcome
    where
        C: Future<Output = ()>,
    {
        let receive = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };

        tokio::select! {
            biased;

            _ = cancel => PollOutcome::Cancelled,
            received = receive => match received {
                Some(()) => PollOutcome::Opened,
                None => {
                    error!("open_signal_channel_closed");
                    panic!("open signal sender dropped while the signal is alive");
                }
            },
            _ = tokio::time::sleep(timeout) => PollOutcome::TimedOut,
        }
    }
}
