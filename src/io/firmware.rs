//! Firmware storage for the gate device
//!
//! The firmware directory holds at most one `<version>.bin` file; its file
//! stem is the current firmware version. Uploads are written to a hidden
//! temporary file and renamed into place before every other image is removed.
//! Installs run one at a time.

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const FIRMWARE_EXTENSION: &str = ".bin";
const MAX_VERSION_LEN: usize = 64;

/// Source of the firmware version the gate device should be running
#[async_trait]
pub trait FirmwareStore: Send + Sync {
    /// Current firmware version, or `None` when nothing was uploaded yet
    async fn current_version(&self) -> anyhow::Result<Option<String>>;
}

/// A firmware image ready to be sent to the device
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub version: String,
    pub bytes: Bytes,
    /// Hex-encoded SHA-256 of `bytes`
    pub sha256: String,
}

impl FirmwareImage {
    pub fn new(version: String, bytes: Bytes) -> Self {
        let sha256 = hex::encode(Sha256::digest(&bytes));
        Self { version, bytes, sha256 }
    }
}

/// Version names double as file names, so keep them to a safe alphabet
pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= MAX_VERSION_LEN
        && !version.starts_with('.')
        && version.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Firmware directory on local disk
pub struct FirmwareDirectory {
    dir: PathBuf,
    install_lock: Mutex<()>,
}

impl FirmwareDirectory {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref().to_path_buf();
        info!(dir = %dir.display(), "firmware_directory_initialized");
        Self { dir, install_lock: Mutex::new(()) }
    }

    fn image_path(&self, version: &str) -> PathBuf {
        self.dir.join(format!("{version}{FIRMWARE_EXTENSION}"))
    }

    /// File names of all `.bin` files in the directory
    async fn image_names(&self) -> anyhow::Result<Vec<String>> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to open firmware directory {}", self.dir.display()))?;

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list firmware directory {}", self.dir.display()))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && name.ends_with(FIRMWARE_EXTENSION) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Versions of all `.bin` files in the directory
    async fn versions(&self) -> anyhow::Result<Vec<String>> {
        let mut versions = Vec::new();
        for name in self.image_names().await? {
            match name.strip_suffix(FIRMWARE_EXTENSION) {
                Some(version) if is_valid_version(version) => versions.push(version.to_string()),
                _ => warn!(file = %name, "firmware_file_name_invalid"),
            }
        }
        Ok(versions)
    }

    /// Read the current firmware image, if any
    pub async fn load_current(&self) -> anyhow::Result<Option<FirmwareImage>> {
        let Some(version) = self.current_version().await? else {
            return Ok(None);
        };

        let path = self.image_path(&version);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(FirmwareImage::new(version, Bytes::from(bytes)))),
            // Replaced by a concurrent upload between listing and reading
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "firmware_image_vanished");
                Ok(None)
            }
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read firmware file {}", path.display())),
        }
    }

    /// Store a new firmware image and remove every other one
    pub async fn install(&self, version: &str, image: &[u8]) -> anyhow::Result<()> {
        if !is_valid_version(version) {
            bail!("invalid firmware version {:?}", version);
        }
        if image.is_empty() {
            bail!("firmware image is empty");
        }

        let _guard = self.install_lock.lock().await;
        let stale = self.image_names().await?;

        let tmp_path = self.dir.join(format!(".{version}.upload"));
        let final_path = self.image_path(version);
        let final_name = format!("{version}{FIRMWARE_EXTENSION}");

        if let Err(e) = tokio::fs::write(&tmp_path, image).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e)
                .with_context(|| format!("Failed to write firmware file {}", tmp_path.display()));
        }
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("Failed to move firmware into {}", final_path.display()))?;
        debug!(path = %final_path.display(), bytes = %image.len(), "firmware_written");

        // Also clears images left behind by an earlier failed install
        for name in stale.into_iter().filter(|name| *name != final_name) {
            let stale_path = self.dir.join(&name);
            match tokio::fs::remove_file(&stale_path).await {
                Ok(()) => info!(file = %name, "firmware_previous_deleted"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to delete previous firmware {}", stale_path.display())
                    })
                }
            }
        }

        info!(version = %version, bytes = %image.len(), "firmware_installed");
        Ok(())
    }
}

#[async_trait]
impl FirmwareStore for FirmwareDirectory {
    async fn current_version(&self) -> anyhow::Result<Option<String>> {
        let mut versions = self.versions().await?;
        if versions.len() > 1 {
            bail!(
                "more than one firmware present in {}: {}",
                self.dir.display(),
                versions.join(", ")
            );
        }
        Ok(versions.pop())
    }
}
