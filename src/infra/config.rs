//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! `GATE_SECRET` in the environment overrides `gate.secret`.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind_address: default_http_bind_address(), port: default_http_port() }
    }
}

fn default_http_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    /// API key the gate device sends in the Authorization header
    #[serde(default)]
    pub secret: String,
    /// Long-poll timeout in seconds
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Ceiling on simultaneously connected gate devices
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            poll_timeout_secs: default_poll_timeout_secs(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_poll_timeout_secs() -> u64 {
    60
}

fn default_max_connections() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirmwareConfig {
    #[serde(default = "default_firmware_directory")]
    pub directory: String,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self { directory: default_firmware_directory() }
    }
}

fn default_firmware_directory() -> String {
    "firmware".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// File path for the open-attempt log (JSONL format)
    #[serde(default = "default_audit_file")]
    pub file: String,
    /// Days an entry is kept before the daily cleanup removes it (0 keeps all)
    #[serde(default = "default_audit_retention_days")]
    pub retention_days: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { file: default_audit_file(), retention_days: default_audit_retention_days() }
    }
}

fn default_audit_file() -> String {
    "audit.jsonl".to_string()
}

fn default_audit_retention_days() -> u64 {
    365
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

/// A resident allowed to use the portal
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserConfig {
    pub id: Uuid,
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub firmware: FirmwareConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    http_bind_address: String,
    http_port: u16,
    gate_secret: String,
    poll_timeout_secs: u64,
    max_connections: usize,
    firmware_directory: String,
    audit_file: String,
    audit_retention_days: u64,
    metrics_interval_secs: u64,
    users: Vec<UserConfig>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_bind_address: default_http_bind_address(),
            http_port: default_http_port(),
            gate_secret: String::new(),
            poll_timeout_secs: default_poll_timeout_secs(),
            max_connections: default_max_connections(),
            firmware_directory: default_firmware_directory(),
            audit_file: default_audit_file(),
            audit_retention_days: default_audit_retention_days(),
            metrics_interval_secs: default_metrics_interval(),
            users: Vec::new(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Config file path when none was given on the command line
    pub fn resolve_config_path() -> String {
        env::var("CONFIG_FILE").unwrap_or_else(|_| "config/dev.toml".to_string())
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, source: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)
            .with_context(|| format!("Failed to parse config file {}", source))?;

        Ok(Self {
            http_bind_address: toml_config.http.bind_address,
            http_port: toml_config.http.port,
            gate_secret: toml_config.gate.secret,
            poll_timeout_secs: toml_config.gate.poll_timeout_secs,
            max_connections: toml_config.gate.max_connections,
            firmware_directory: toml_config.firmware.directory,
            audit_file: toml_config.audit.file,
            audit_retention_days: toml_config.audit.retention_days,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            users: toml_config.users,
            config_file: source.to_string(),
        })
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load configuration from a path, falling back to defaults when the file is missing.
    ///
    /// A file that exists but does not parse is an error: starting with defaults
    /// would silently drop the configured users and secret.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            warn!(config_file = %path.display(), "config_file_missing_using_defaults");
            Self::default()
        };

        if let Ok(secret) = env::var("GATE_SECRET") {
            config.gate_secret = secret;
        }

        Ok(config)
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gate_secret.trim().is_empty() {
            bail!("gate.secret is required (set it in the config file or GATE_SECRET)");
        }
        if self.poll_timeout_secs == 0 {
            bail!("gate.poll_timeout_secs must be greater than 0");
        }
        if self.max_connections == 0 {
            bail!("gate.max_connections must be greater than 0");
        }
        for (i, user) in self.users.iter().enumerate() {
            if user.token.trim().is_empty() {
                bail!("users[{}] ({}) has an empty token", i, user.name);
            }
            if self.users[..i].iter().any(|other| other.token == user.token) {
                bail!("users[{}] ({}) reuses another user's token", i, user.name);
            }
        }
        Ok(())
    }

    pub fn http_bind_address(&self) -> &str {
        &self.http_bind_address
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn gate_secret(&self) -> &str {
        &self.gate_secret
    }

    pub fn poll_timeout_secs(&self) -> u64 {
        self.poll_timeout_secs
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn firmware_directory(&self) -> &str {
        &self.firmware_directory
    }

    pub fn audit_file(&self) -> &str {
        &self.audit_file
    }

    pub fn audit_retention_days(&self) -> u64 {
        self.audit_retention_days
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn users(&self) -> &[UserConfig] {
        &self.users
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the gate secret
    pub fn with_gate_secret(mut self, secret: &str) -> Self {
        self.gate_secret = secret.to_string();
        self
    }

    /// Builder method for tests to add a user
    pub fn with_user(mut self, user: UserConfig) -> Self {
        self.users.push(user);
        self
    }
}
