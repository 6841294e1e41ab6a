//! Shared types for the gate portal

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Newtype wrapper for user IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct UserId(pub Uuid);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(UserId)
    }
}

/// An authenticated resident or administrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub admin: bool,
}

/// Result of one device poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A pending open signal was consumed by this poll
    Opened,
    /// No signal arrived before the poll timeout
    TimedOut,
    /// The request went away before a signal or the timeout
    Cancelled,
    /// The device runs a different firmware than the one stored
    UpgradeRequired,
    /// Too many devices already connected
    Saturated,
}

impl PollOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollOutcome::Opened => "opened",
            PollOutcome::TimedOut => "timed_out",
            PollOutcome::Cancelled => "cancelled",
            PollOutcome::UpgradeRequired => "upgrade_required",
            PollOutcome::Saturated => "saturated",
        }
    }
}

impl std::fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one human open request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The signal was newly queued
    Opening,
    /// A signal was already pending; nothing new was queued
    AlreadyOpening,
    /// The attempt could not be recorded, so no signal was sent
    Failed(String),
}

impl OpenOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenOutcome::Opening => "opening",
            OpenOutcome::AlreadyOpening => "already_opening",
            OpenOutcome::Failed(_) => "failed",
        }
    }
}

/// Audit record of one open attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// New entry stamped with the current time
    pub fn new(user_id: UserId) -> Self {
        Self { id: Uuid::now_v7(), user_id, created_at: Utc::now() }
    }

    /// Serialize to a single JSON line
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
