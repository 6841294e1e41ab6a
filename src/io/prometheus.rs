//! Prometheus text exposition of the portal metrics
//!
//! Served at /metrics by the portal HTTP server.

use crate::infra::metrics::MetricsSummary;
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge)
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

/// Write one counter family split by an `outcome` label
fn write_outcomes(output: &mut String, name: &str, help: &str, outcomes: &[(&str, u64)]) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (outcome, val) in outcomes {
        let _ = writeln!(output, "{name}{{outcome=\"{outcome}\"}} {val}");
    }
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary, gate_capacity: usize) -> String {
    let mut output = String::with_capacity(2048);

    write_open_metrics(&mut output, summary);
    write_poll_metrics(&mut output, summary);
    write_gate_metrics(&mut output, summary, gate_capacity);

    output
}

fn write_open_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "gate_portal_open_requests_total",
        "Open requests received from residents",
        MetricType::Counter,
        summary.open_requests_total,
    );
    write_outcomes(
        output,
        "gate_portal_open_outcomes_total",
        "Open requests by outcome",
        &[
            ("opening", summary.opens_queued_total),
            ("already_opening", summary.opens_collapsed_total),
            ("failed", summary.audit_failures_total),
        ],
    );
}

fn write_poll_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "gate_portal_polls_total",
        "Gate device long-polls served",
        MetricType::Counter,
        summary.polls_total,
    );
    write_outcomes(
        output,
        "gate_portal_poll_outcomes_total",
        "Gate device long-polls by outcome",
        &[
            ("opened", summary.polls_opened_total),
            ("timed_out", summary.polls_timed_out_total),
            ("cancelled", summary.polls_cancelled_total),
            ("upgrade_required", summary.polls_upgrade_required_total),
            ("saturated", summary.polls_saturated_total),
        ],
    );
}

fn write_gate_metrics(output: &mut String, summary: &MetricsSummary, gate_capacity: usize) {
    write_metric(
        output,
        "gate_portal_gate_connections",
        "Gate devices currently long-polling",
        MetricType::Gauge,
        summary.connected_gates as u64,
    );
    write_metric(
        output,
        "gate_portal_gate_capacity",
        "Maximum simultaneous gate connections",
        MetricType::Gauge,
        gate_capacity as u64,
    );
    write_metric(
        output,
        "gate_portal_open_pending",
        "Whether an open signal is waiting for the gate (0/1)",
        MetricType::Gauge,
        u64::from(summary.open_pending),
    );
}
