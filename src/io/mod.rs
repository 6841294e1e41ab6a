//! IO modules - external system interfaces
//!
//! - `http` - Portal HTTP server (resident, gate device, admin routes)
//! - `audit_log` - Open attempt audit log (JSONL file or in-memory)
//! - `firmware` - Gate firmware directory
//! - `prometheus` - Prometheus text format for /metrics

pub mod audit_log;
pub mod firmware;
pub mod http;
pub mod prometheus;

// Re-export commonly used types
pub use audit_log::{retention_cutoff, AuditLog, JsonlAuditLog, MemoryAuditLog};
pub use firmware::{FirmwareDirectory, FirmwareImage, FirmwareStore};
pub use http::{serve, start_http_server, AppState};
