//! Gate long-poll handler
//!
//! One call per device poll: take a connection slot, record the firmware the
//! device reports, send it to upgrade if it runs something else than the
//! stored firmware, otherwise wait on the open signal until it fires, the
//! poll times out, or the request is cancelled.

use crate::domain::types::PollOutcome;
use crate::infra::metrics::Metrics;
use crate::io::firmware::FirmwareStore;
use crate::services::connection_tracker::GateConnectionTracker;
use crate::services::open_signal::OpenSignal;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Last firmware version reported by a gate device (display only)
#[derive(Debug, Default)]
pub struct RunningVersion {
    version: RwLock<Option<String>>,
}

impl RunningVersion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, version: &str) {
        *self.version.write() = Some(version.to_string());
    }

    pub fn get(&self) -> Option<String> {
        self.version.read().clone()
    }
}

/// Records the poll outcome when dropped, whether or not the poll completed
struct PollRecord<'a> {
    metrics: &'a Metrics,
    outcome: Option<PollOutcome>,
}

impl Drop for PollRecord<'_> {
    fn drop(&mut self) {
        self.metrics.record_poll(self.outcome.unwrap_or(PollOutcome::Cancelled));
    }
}

pub struct GateLongPoll {
    signal: Arc<OpenSignal>,
    tracker: Arc<GateConnectionTracker>,
    firmware: Arc<dyn FirmwareStore>,
    running_version: Arc<RunningVersion>,
    metrics: Arc<Metrics>,
    timeout: Duration,
}

impl GateLongPoll {
    pub fn new(
        signal: Arc<OpenSignal>,
        tracker: Arc<GateConnectionTracker>,
        firmware: Arc<dyn FirmwareStore>,
        running_version: Arc<RunningVersion>,
        metrics: Arc<Metrics>,
        timeout: Duration,
    ) -> Self {
        Self { signal, tracker, firmware, running_version, metrics, timeout }
    }

    /// Serve one device poll.
    ///
    /// `reported_version` is the firmware the device says it runs; `cancel`
    /// resolves when the request should be abandoned. A poll whose future is
    /// dropped before it finishes (client disconnect) is counted as cancelled.
    pub async fn poll<C>(&self, reported_version: Option<&str>, cancel: C) -> PollOutcome
    where
        C: Future<Output = ()>,
    {
        let mut record = PollRecord { metrics: &self.metrics, outcome: None };
        let outcome = self.poll_inner(reported_version, cancel).await;
        record.outcome = Some(outcome);
        outcome
    }

    async fn poll_inner<C>(&self, reported_version: Option<&str>, cancel: C) -> PollOutcome
    where
        C: Future<Output = ()>,
    {
        let Some(_slot) = self.tracker.try_enter() else {
            warn!(
                connected = %self.tracker.count(),
                capacity = %self.tracker.capacity(),
                "gate_poll_rejected_at_capacity"
            );
            return PollOutcome::Saturated;
        };

        let reported_version = reported_version.map(str::trim).filter(|v| !v.is_empty());
        if let Some(version) = reported_version {
            self.running_version.set(version);
        }

        if let Some(running) = reported_version {
            match self.firmware.current_version().await {
                Ok(Some(current)) if current != running => {
                    info!(
                        running_version = %running,
                        current_version = %current,
                        "gate_firmware_mismatch_upgrade_required"
                    );
                    return PollOutcome::UpgradeRequired;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        running_version = %running,
                        error = %e,
                        "gate_firmware_version_unavailable"
                    );
                }
            }
        }

        debug!(connected = %self.tracker.count(), timeout_secs = %self.timeout.as_secs(), "gate_poll_waiting");
        let outcome = self.signal.wait_or_timeout(self.timeout, cancel).await;
        debug!(outcome = %outcome, "gate_poll_finished");
        outcome
    }

    pub fn connected(&self) -> usize {
        self.tracker.count()
    }
}
