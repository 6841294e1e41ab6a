//! Audit log of gate open attempts
//!
//! Every open request is recorded before the open signal is sent. The file
//! backend writes JSONL (one `AuditEntry` per line), appending under a lock so
//! concurrent requests never interleave partial lines. Entries older than the
//! retention window are dropped by rewriting the file under the same lock.

use crate::domain::types::{AuditEntry, UserId};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Persistence for open attempts
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Record that `user_id` asked for the gate to open
    async fn record_open_attempt(&self, user_id: UserId) -> anyhow::Result<AuditEntry>;

    /// All recorded attempts of one user, newest first
    async fn entries_for(&self, user_id: UserId) -> anyhow::Result<Vec<AuditEntry>>;

    /// Delete entries created before `cutoff`, returning how many were removed
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize>;
}

/// Oldest creation time kept for a retention of `retention_days`.
///
/// `None` means keep everything: retention is disabled (0) or reaches
/// further back than the calendar can express.
pub fn retention_cutoff(now: DateTime<Utc>, retention_days: u64) -> Option<DateTime<Utc>> {
    if retention_days == 0 {
        return None;
    }
    let window = TimeDelta::try_days(i64::try_from(retention_days).ok()?)?;
    now.checked_sub_signed(window)
}

/// Append-only JSONL file
pub struct JsonlAuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        info!(file_path = %path.display(), "audit_log_initialized");
        Self { path, write_lock: Mutex::new(()) }
    }

    async fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let _guard = self.write_lock.lock().await;
        let mut file =
            tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;

        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;

        debug!(file = %self.path.display(), bytes = %buf.len(), "audit_entry_written");
        Ok(())
    }

    async fn read_content(&self) -> anyhow::Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read audit log {}", self.path.display()))
            }
        }
    }

    fn rewrite_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".rewrite");
        PathBuf::from(name)
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn record_open_attempt(&self, user_id: UserId) -> anyhow::Result<AuditEntry> {
        let entry = AuditEntry::new(user_id);
        let line = entry.to_json().context("Failed to serialize audit entry")?;
        self.append_line(&line)
            .await
            .with_context(|| format!("Failed to append to audit log {}", self.path.display()))?;
        Ok(entry)
    }

    async fn entries_for(&self, user_id: UserId) -> anyhow::Result<Vec<AuditEntry>> {
        let Some(content) = self.read_content().await? else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) if entry.user_id == user_id => entries.push(entry),
                Ok(_) => {}
                Err(e) => {
                    warn!(line = line_no + 1, error = %e, "audit_log_line_invalid");
                }
            }
        }

        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        // Appends wait until the rewritten file is in place
        let _guard = self.write_lock.lock().await;

        let Some(content) = self.read_content().await? else {
            return Ok(0);
        };

        let mut kept = String::with_capacity(content.len());
        let mut removed = 0;
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            // Unparsable lines are kept for whoever inspects the file
            if let Ok(entry) = serde_json::from_str::<AuditEntry>(line) {
                if entry.created_at < cutoff {
                    removed += 1;
                    continue;
                }
            }
            kept.push_str(line);
            kept.push('\n');
        }

        if removed == 0 {
            return Ok(0);
        }

        let rewrite_path = self.rewrite_path();
        if let Err(e) = tokio::fs::write(&rewrite_path, kept.as_bytes()).await {
            let _ = tokio::fs::remove_file(&rewrite_path).await;
            return Err(e)
                .with_context(|| format!("Failed to write audit log {}", rewrite_path.display()));
        }
        tokio::fs::rename(&rewrite_path, &self.path)
            .await
            .with_context(|| format!("Failed to replace audit log {}", self.path.display()))?;

        info!(file = %self.path.display(), removed = %removed, cutoff = %cutoff, "audit_log_pruned");
        Ok(removed)
    }
}

/// In-process audit log, for tests and ephemeral deployments
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: parking_lot::Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record_open_attempt(&self, user_id: UserId) -> anyhow::Result<AuditEntry> {
        let entry = AuditEntry::new(user_id);
        self.entries.lock().push(entry.clone());
        Ok(entry)
    }

    async fn entries_for(&self, user_id: UserId) -> anyhow::Result<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> =
            self.entries.lock().iter().filter(|e| e.user_id == user_id).cloned().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.created_at >= cutoff);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn user() -> UserId {
        UserId(Uuid::now_v7())
    }

    fn entry_aged(user_id: UserId, days: i64) -> AuditEntry {
        AuditEntry { created_at: Utc::now() - TimeDelta::days(days), ..AuditEntry::new(user_id) }
    }

    fn write_entries(path: &Path, entries: &[AuditEntry]) {
        let mut content = String::new();
        for entry in entries {
            content.push_str(&entry.to_json().unwrap());
            content.push('\n');
        }
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_jsonl_append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");
        let log = JsonlAuditLog::new(&path);

        let alice = user();
        let bob = user();
        let first = log.record_open_attempt(alice).await.unwrap();
        log.record_open_attempt(bob).await.unwrap();
        let second = log.record_open_attempt(alice).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.ends_with('\n'));

        let entries = log.entries_for(alice).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains(&first));
        assert!(entries.contains(&second));
        assert!(entries[0].created_at >= entries[1].created_at);
    }

    #[tokio::test]
    async fn test_jsonl_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let log = JsonlAuditLog::new(dir.path().join("none.jsonl"));
        assert!(log.entries_for(user()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jsonl_skips_corrupt_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = JsonlAuditLog::new(&path);

        let alice = user();
        log.record_open_attempt(alice).await.unwrap();
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            std::io::Write::write_all(&mut file, b"{not json\n").unwrap();
        }
        log.record_open_attempt(alice).await.unwrap();

        assert_eq!(log.entries_for(alice).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_write_failure_is_reported() {
        let dir = tempdir().unwrap();
        // A directory where the log file should be makes the open fail
        let path = dir.path().join("audit.jsonl");
        std::fs::create_dir(&path).unwrap();
        let log = JsonlAuditLog::new(&path);

        let err = log.record_open_attempt(user()).await.unwrap_err();
        assert!(err.to_string().contains("audit log"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jsonl_concurrent_appends_keep_lines_whole() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = Arc::new(JsonlAuditLog::new(&path));
        let alice = user();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let log = log.clone();
            handles.push(tokio::spawn(async move { log.record_open_attempt(alice).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        for line in content.lines() {
            serde_json::from_str::<AuditEntry>(line).unwrap();
        }
        assert_eq!(log.entries_for(alice).await.unwrap().len(), 20);
    }

    #[test]
    fn test_retention_cutoff() {
        let now = Utc::now();
        assert_eq!(retention_cutoff(now, 0), None);
        assert_eq!(retention_cutoff(now, 30), Some(now - TimeDelta::days(30)));
        assert_eq!(retention_cutoff(now, u64::MAX), None);
    }

    #[tokio::test]
    async fn test_jsonl_prune_drops_expired_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let alice = user();
        let old = entry_aged(alice, 400);
        let recent = entry_aged(alice, 10);
        write_entries(&path, &[old.clone(), recent.clone()]);
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            std::io::Write::write_all(&mut file, b"{not json\n").unwrap();
        }
        let log = JsonlAuditLog::new(&path);

        let cutoff = retention_cutoff(Utc::now(), 365).unwrap();
        assert_eq!(log.prune_before(cutoff).await.unwrap(), 1);
        assert_eq!(log.entries_for(alice).await.unwrap(), vec![recent]);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("{not json"));
        assert!(!dir.path().join("audit.jsonl.rewrite").exists());

        // Nothing left to remove: the file is not rewritten
        assert_eq!(log.prune_before(cutoff).await.unwrap(), 0);
        log.record_open_attempt(alice).await.unwrap();
        assert_eq!(log.entries_for(alice).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_prune_missing_file() {
        let dir = tempdir().unwrap();
        let log = JsonlAuditLog::new(dir.path().join("none.jsonl"));
        assert_eq!(log.prune_before(Utc::now()).await.unwrap(), 0);
        assert!(!dir.path().join("none.jsonl").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jsonl_prune_does_not_lose_concurrent_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let alice = user();
        let old: Vec<AuditEntry> = (0..50).map(|_| entry_aged(alice, 400)).collect();
        write_entries(&path, &old);
        let log = Arc::new(JsonlAuditLog::new(&path));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.record_open_attempt(alice).await.map(|_| ())
            }));
        }
        let cutoff = retention_cutoff(Utc::now(), 30).unwrap();
        let pruned = {
            let log = log.clone();
            tokio::spawn(async move { log.prune_before(cutoff).await })
        };
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(pruned.await.unwrap().unwrap(), 50);
        assert_eq!(log.entries_for(alice).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_memory_log_prune() {
        let log = MemoryAuditLog::new();
        log.record_open_attempt(user()).await.unwrap();

        assert_eq!(log.prune_before(Utc::now() - TimeDelta::days(1)).await.unwrap(), 0);
        assert_eq!(log.prune_before(Utc::now() + TimeDelta::days(1)).await.unwrap(), 1);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_memory_log() {
        let log = MemoryAuditLog::new();
        assert!(log.is_empty());

        let alice = user();
        log.record_open_attempt(alice).await.unwrap();
        log.record_open_attempt(user()).await.unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries_for(alice).await.unwrap().len(), 1);
    }
}
