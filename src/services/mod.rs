//! Services - gate rendezvous and request handling
//!
//! - `open_signal` - Capacity-1 hand-off between open requests and gate polls
//! - `connection_tracker` - Bounded gauge of connected gate devices
//! - `long_poll` - Gate device long-poll handler
//! - `open_request` - Resident open request handler
//! - `auth` - Bearer token and gate key authentication

pub mod auth;
pub mod connection_tracker;
pub mod long_poll;
pub mod open_request;
pub mod open_signal;

// Re-export commonly used types
pub use auth::Authenticator;
pub use connection_tracker::{ConnectionGuard, GateConnectionTracker};
pub use long_poll::{GateLongPoll, RunningVersion};
pub use open_request::OpenRequest;
pub use open_signal::OpenSignal;
