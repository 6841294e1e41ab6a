//! Gate portal - residential gate access server
//!
//! Residents ask the gate to open over HTTP; the gate controller long-polls
//! the portal and opens when it receives the signal.
//!
//! Module structure:
//! - `domain/` - Core types (User, outcomes, audit entries)
//! - `io/` - External interfaces (HTTP server, audit log, firmware store)
//! - `services/` - Gate rendezvous (open signal, connection tracker, handlers)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use chrono::Utc;
use gate_portal::infra::{Config, Metrics};
use gate_portal::io::{retention_cutoff, start_http_server, AppState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const AUDIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Gate portal - residential gate access server
#[derive(Parser, Debug)]
#[command(name = "gate-portal", version, about)]
struct Args {
    /// Path to TOML configuration file (defaults to CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug to see every poll
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "gate-portal starting");

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(Config::resolve_config_path);

    let config = Config::load_from_path(&config_path)?;
    config.validate().with_context(|| format!("Invalid configuration in {}", config.config_file()))?;

    info!(
        config_file = %config.config_file(),
        bind_address = %config.http_bind_address(),
        port = %config.http_port(),
        poll_timeout_secs = %config.poll_timeout_secs(),
        max_connections = %config.max_connections(),
        firmware_directory = %config.firmware_directory(),
        audit_file = %config.audit_file(),
        audit_retention_days = %config.audit_retention_days(),
        users = %config.users().len(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create shared components
    let metrics = Arc::new(Metrics::new());
    let state = Arc::new(AppState::from_config(&config, metrics.clone()));

    // Start metrics reporter
    let reporter_state = state.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            let summary = reporter_state
                .metrics
                .report(reporter_state.tracker.count(), reporter_state.signal.is_pending());
            summary.log();
        }
    });

    // Daily audit log cleanup, first run at startup
    let retention_days = config.audit_retention_days();
    if retention_days > 0 {
        let audit = state.audit.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(AUDIT_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                let Some(cutoff) = retention_cutoff(Utc::now(), retention_days) else {
                    continue;
                };
                match audit.prune_before(cutoff).await {
                    Ok(removed) => debug!(removed = %removed, "audit_log_cleanup_finished"),
                    Err(e) => error!(error = %format!("{e:#}"), "audit_log_cleanup_failed"),
                }
            }
        });
    }

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Run the HTTP server until shutdown
    let bind_address = config.http_bind_address().to_string();
    let port = config.http_port();
    let server = tokio::spawn(async move {
        start_http_server(&bind_address, port, state, shutdown_rx).await
    });

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %format!("{e:#}"), "http_server_failed");
            return Err(e);
        }
        Err(e) => return Err(e).context("HTTP server task panicked"),
    }

    // Gate polls still in flight observe the same shutdown signal and abort
    info!("gate-portal shutdown complete");
    Ok(())
}
