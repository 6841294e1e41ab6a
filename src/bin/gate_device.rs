//! Gate device simulator
//!
//! Behaves like the gate controller firmware: long-polls the portal with the
//! gate key, "opens" on 200, re-polls immediately on 408, and downloads the
//! new firmware on 426 before polling again with the new version.
//!
//! Usage:
//!   cargo run --bin gate-device -- --url http://127.0.0.1:8080 --key <secret>

use anyhow::{bail, Context};
use clap::Parser;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "gate-device", about = "Gate controller simulator for the gate portal")]
struct Args {
    /// Portal base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Gate key
    #[arg(long, env = "GATE_SECRET")]
    key: String,

    /// Firmware version reported to the portal
    #[arg(long, default_value = "0.0.0")]
    version: String,

    /// Client-side request timeout in seconds (longer than the portal's poll timeout)
    #[arg(long, default_value = "90")]
    request_timeout_secs: u64,

    /// Stop after this many opens (0 = run forever)
    #[arg(long, default_value = "0")]
    opens: u64,
}

struct Device {
    client: reqwest::Client,
    base_url: String,
    key: String,
    version: String,
}

impl Device {
    /// One long-poll; returns the status the portal answered with
    async fn poll(&self) -> anyhow::Result<StatusCode> {
        let response = self
            .client
            .get(format!("{}/gate", self.base_url))
            .header("Authorization", &self.key)
            .header("X-Version", &self.version)
            .send()
            .await
            .context("gate poll failed")?;
        Ok(response.status())
    }

    /// Fetch the current firmware and switch to its version
    async fn upgrade(&mut self) -> anyhow::Result<()> {
        let response = self
            .client
            .get(format!("{}/gate/firmware", self.base_url))
            .header("X-Esp32-Version", &self.version)
            .send()
            .await
            .context("firmware download failed")?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_MODIFIED => {
                info!(version = %self.version, "firmware_up_to_date");
                return Ok(());
            }
            status => bail!("firmware download returned {status}"),
        }

        let header = |name: &str| {
            response.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
        };
        let expected = header("x-sha256").context("firmware response without x-sha256")?;
        let version = header("x-firmware-version").context("firmware response without version")?;

        let image = response.bytes().await.context("firmware body truncated")?;
        let actual = hex::encode(Sha256::digest(&image));
        if actual != expected {
            bail!("firmware checksum mismatch: expected {expected}, got {actual}");
        }

        info!(from = %self.version, to = %version, bytes = %image.len(), "firmware_flashed");
        self.version = version;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .http1_only()
        .build()
        .context("failed to build HTTP client")?;

    let mut device = Device {
        client,
        base_url: args.url.trim_end_matches('/').to_string(),
        key: args.key,
        version: args.version,
    };
    info!(url = %device.base_url, version = %device.version, "gate_device_started");

    let mut opens = 0u64;
    loop {
        match device.poll().await {
            Ok(StatusCode::OK) => {
                opens += 1;
                info!(opens = %opens, "gate_opened");
                if args.opens > 0 && opens >= args.opens {
                    return Ok(());
                }
            }
            Ok(StatusCode::REQUEST_TIMEOUT) => debug!("gate_poll_timed_out"),
            Ok(StatusCode::UPGRADE_REQUIRED) => {
                if let Err(e) = device.upgrade().await {
                    error!(error = %format!("{e:#}"), "firmware_upgrade_failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
            Ok(StatusCode::UNAUTHORIZED) => bail!("portal rejected the gate key"),
            Ok(status) => {
                warn!(status = %status, "gate_poll_unexpected_status");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "gate_poll_error");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
}
