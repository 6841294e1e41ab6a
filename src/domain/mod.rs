//! Domain models - core business types
//!
//! This module contains the canonical data types used throughout the system:
//! - `User` / `UserId` - authenticated residents
//! - `PollOutcome` - result of one gate device poll
//! - `OpenOutcome` - result of one human open request
//! - `AuditEntry` - record of an open attempt

pub mod types;

pub use types::{AuditEntry, OpenOutcome, PollOutcome, User, UserId};
