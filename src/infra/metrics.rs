//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only; do NOT use them for coordination or logic decisions.
//! The connection gauge lives in `GateConnectionTracker`, not here.

use crate::domain::types::{OpenOutcome, PollOutcome};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lock-free metrics collector
pub struct Metrics {
    /// Open requests received from residents (monotonic)
    open_requests_total: AtomicU64,
    /// Requests that queued a new open signal (monotonic)
    opens_queued_total: AtomicU64,
    /// Requests that found a signal already pending (monotonic)
    opens_collapsed_total: AtomicU64,
    /// Requests refused because the audit write failed (monotonic)
    audit_failures_total: AtomicU64,
    /// Device polls started (monotonic)
    polls_total: AtomicU64,
    polls_opened_total: AtomicU64,
    polls_timed_out_total: AtomicU64,
    polls_cancelled_total: AtomicU64,
    polls_upgrade_required_total: AtomicU64,
    polls_saturated_total: AtomicU64,
    /// Polls since last report (reset on report)
    polls_since_report: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            open_requests_total: AtomicU64::new(0),
            opens_queued_total: AtomicU64::new(0),
            opens_collapsed_total: AtomicU64::new(0),
            audit_failures_total: AtomicU64::new(0),
            polls_total: AtomicU64::new(0),
            polls_opened_total: AtomicU64::new(0),
            polls_timed_out_total: AtomicU64::new(0),
            polls_cancelled_total: AtomicU64::new(0),
            polls_upgrade_required_total: AtomicU64::new(0),
            polls_saturated_total: AtomicU64::new(0),
            polls_since_report: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    /// Record the outcome of one open request (lock-free)
    #[inline]
    pub fn record_open_request(&self, outcome: &OpenOutcome) {
        self.open_requests_total.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            OpenOutcome::Opening => &self.opens_queued_total,
            OpenOutcome::AlreadyOpening => &self.opens_collapsed_total,
            OpenOutcome::Failed(_) => &self.audit_failures_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one device poll (lock-free)
    #[inline]
    pub fn record_poll(&self, outcome: PollOutcome) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
        self.polls_since_report.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            PollOutcome::Opened => &self.polls_opened_total,
            PollOutcome::TimedOut => &self.polls_timed_out_total,
            PollOutcome::Cancelled => &self.polls_cancelled_total,
            PollOutcome::UpgradeRequired => &self.polls_upgrade_required_total,
            PollOutcome::Saturated => &self.polls_saturated_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters, resetting the periodic ones
    pub fn report(&self, connected_gates: usize, open_pending: bool) -> MetricsSummary {
        let polls_count = self.polls_since_report.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let polls_per_min = if elapsed.as_secs_f64() > 0.0 {
            polls_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        self.summary(polls_per_min, connected_gates, open_pending)
    }

    /// Snapshot all counters without touching the periodic window (for scrapes)
    pub fn snapshot(&self, connected_gates: usize, open_pending: bool) -> MetricsSummary {
        self.summary(0.0, connected_gates, open_pending)
    }

    fn summary(&self, polls_per_min: f64, connected_gates: usize, open_pending: bool) -> MetricsSummary {
        MetricsSummary {
            open_requests_total: self.open_requests_total.load(Ordering::Relaxed),
            opens_queued_total: self.opens_queued_total.load(Ordering::Relaxed),
            opens_collapsed_total: self.opens_collapsed_total.load(Ordering::Relaxed),
            audit_failures_total: self.audit_failures_total.load(Ordering::Relaxed),
            polls_total: self.polls_total.load(Ordering::Relaxed),
            polls_opened_total: self.polls_opened_total.load(Ordering::Relaxed),
            polls_timed_out_total: self.polls_timed_out_total.load(Ordering::Relaxed),
            polls_cancelled_total: self.polls_cancelled_total.load(Ordering::Relaxed),
            polls_upgrade_required_total: self.polls_upgrade_required_total.load(Ordering::Relaxed),
            polls_saturated_total: self.polls_saturated_total.load(Ordering::Relaxed),
            polls_per_min,
            connected_gates,
            open_pending,
        }
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub open_requests_total: u64,
    pub opens_queued_total: u64,
    pub opens_collapsed_total: u64,
    pub audit_failures_total: u64,
    pub polls_total: u64,
    pub polls_opened_total: u64,
    pub polls_timed_out_total: u64,
    pub polls_cancelled_total: u64,
    pub polls_upgrade_required_total: u64,
    pub polls_saturated_total: u64,
    /// Polls per minute since the previous report
    pub polls_per_min: f64,
    pub connected_gates: usize,
    pub open_pending: bool,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            open_requests = %self.open_requests_total,
            opens_queued = %self.opens_queued_total,
            opens_collapsed = %self.opens_collapsed_total,
            audit_failures = %self.audit_failures_total,
            polls = %self.polls_total,
            polls_per_min = format!("{:.1}", self.polls_per_min),
            polls_opened = %self.polls_opened_total,
            polls_timed_out = %self.polls_timed_out_total,
            connected_gates = %self.connected_gates,
            open_pending = %self.open_pending,
            "metrics"
        );
    }
}
