//! Request authentication
//!
//! Residents present a bearer token that maps to a configured user; the gate
//! device presents the shared gate secret in the Authorization header, with
//! or without the `Bearer ` scheme.

use crate::domain::types::{User, UserId};
use crate::infra::config::Config;
use rustc_hash::FxHashMap;
use tracing::info;

pub struct Authenticator {
    users: FxHashMap<String, User>,
    gate_secret: String,
}

/// Strip an optional `Bearer ` scheme from an Authorization header value
fn credential(authorization: &str) -> &str {
    let value = authorization.trim();
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim()
}

/// Compare secrets without short-circuiting on the first differing byte
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl Authenticator {
    pub fn from_config(config: &Config) -> Self {
        let users: FxHashMap<String, User> = config
            .users()
            .iter()
            .map(|u| {
                let user = User { id: UserId(u.id), name: u.name.clone(), admin: u.admin };
                (u.token.clone(), user)
            })
            .collect();

        info!(users = %users.len(), "authenticator_initialized");
        Self { users, gate_secret: config.gate_secret().to_string() }
    }

    /// Resolve the user behind an Authorization header value
    pub fn user(&self, authorization: Option<&str>) -> Option<&User> {
        let token = credential(authorization?);
        if token.is_empty() {
            return None;
        }
        self.users.get(token)
    }

    /// Whether the Authorization header carries the gate secret
    pub fn is_gate(&self, authorization: Option<&str>) -> bool {
        match authorization {
            Some(value) if !self.gate_secret.is_empty() => {
                constant_time_eq(credential(value).as_bytes(), self.gate_secret.as_bytes())
            }
            _ => false,
        }
    }
}
