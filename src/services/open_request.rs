//! Resident open requests
//!
//! The attempt is written to the audit log first; only a recorded attempt may
//! queue the open signal. A signal that is already pending is not an error,
//! the request simply joins it.

use crate::domain::types::{OpenOutcome, User};
use crate::infra::metrics::Metrics;
use crate::io::audit_log::AuditLog;
use crate::services::open_signal::OpenSignal;
use std::sync::Arc;
use tracing::{error, info};

pub struct OpenRequest {
    signal: Arc<OpenSignal>,
    audit: Arc<dyn AuditLog>,
    metrics: Arc<Metrics>,
}

impl OpenRequest {
    pub fn new(signal: Arc<OpenSignal>, audit: Arc<dyn AuditLog>, metrics: Arc<Metrics>) -> Self {
        Self { signal, audit, metrics }
    }

    /// Ask the gate to open on behalf of an authenticated user
    pub async fn request_open(&self, user: &User) -> OpenOutcome {
        let outcome = match self.audit.record_open_attempt(user.id).await {
            Ok(entry) => {
                let outcome = if self.signal.try_open() {
                    OpenOutcome::Opening
                } else {
                    OpenOutcome::AlreadyOpening
                };
                info!(
                    user_id = %user.id,
                    user = %user.name,
                    audit_id = %entry.id,
                    outcome = %outcome.as_str(),
                    "open_requested"
                );
                outcome
            }
            Err(e) => {
                error!(user_id = %user.id, error = %e, "open_request_audit_failed");
                OpenOutcome::Failed(format!("{e:#}"))
            }
        };

        self.metrics.record_open_request(&outcome);
        outcome
    }
}
