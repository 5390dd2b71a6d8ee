//! Sync log: bounded, persisted audit trail of applied and sent operations
//!
//! The whole log is one compact JSON array on disk. The file is read once,
//! then served from memory; each append rewrites it under a process-local
//! mutex. A second process writing the same file is unsupported.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::ChangeSource;

/// Entries kept on disk; older ones are evicted first
pub const MAX_JOURNAL_ENTRIES: usize = 1000;

/// Default page size for [`SyncJournal::recent`]
pub const DEFAULT_QUERY_LIMIT: usize = 50;

/// Well-known journal tags
pub mod actions {
    pub const FILE_UPDATED: &str = "file_updated";
    pub const FILE_DELETED: &str = "file_deleted";
    pub const FILES_UPDATED: &str = "files_updated";
    pub const WEBHOOK_RECEIVED: &str = "webhook_received";
    pub const SENT_TO_REMOTE: &str = "sent_to_remote";
    pub const SYNC_ERROR: &str = "sync_error";
    pub const DATABASE_SYNC: &str = "database_sync";
}

/// One journal entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub action: String,
    pub source: ChangeSource,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SyncLogEntry {
    pub fn new(action: impl Into<String>, source: ChangeSource, data: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            source,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Result of a journal query
#[derive(Debug, Clone, Serialize)]
pub struct JournalPage {
    /// Most recent first
    pub logs: Vec<SyncLogEntry>,
    /// Entries currently retained (not a lifetime count)
    pub total: usize,
}

/// File-backed sync journal
pub struct SyncJournal {
    path: PathBuf,
    capacity: usize,
    /// Entries as last written, loaded on first use
    cache: Mutex<Option<Vec<SyncLogEntry>>>,
}

impl SyncJournal {
    /// Open a journal at `path`. The file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_capacity(path, MAX_JOURNAL_ENTRIES)
    }

    pub fn with_capacity(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            capacity: capacity.max(1),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry, evicting the oldest beyond capacity
    pub fn append(&self, entry: SyncLogEntry) -> Result<()> {
        let mut cache = self.cache.lock();
        let entries = Self::loaded(&self.path, &mut cache)?;

        entries.push(entry);
        if entries.len() > self.capacity {
            let excess = entries.len() - self.capacity;
            entries.drain(..excess);
        }

        if let Err(e) = self.persist(entries) {
            // Memory is ahead of disk; re-read on next use
            *cache = None;
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self, entries: &[SyncLogEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec(entries)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Append, reporting failures to the tracing log instead of the caller.
    ///
    /// Journal failures never abort the operation being journaled.
    pub fn record(&self, action: &str, source: ChangeSource, data: serde_json::Value) {
        if let Err(e) = self.append(SyncLogEntry::new(action, source, data)) {
            tracing::warn!("Failed to append '{}' to sync log: {}", action, e);
        }
    }

    /// The most recent `limit` entries, newest first
    pub fn recent(&self, limit: usize) -> Result<JournalPage> {
        let mut cache = self.cache.lock();
        let entries = Self::loaded(&self.path, &mut cache)?;

        let total = entries.len();
        let logs = entries.iter().rev().take(limit).cloned().collect();
        Ok(JournalPage { logs, total })
    }

    /// Every retained entry, oldest first
    pub fn all(&self) -> Result<Vec<SyncLogEntry>> {
        let mut cache = self.cache.lock();
        Ok(Self::loaded(&self.path, &mut cache)?.clone())
    }

    fn loaded<'a>(
        path: &Path,
        cache: &'a mut Option<Vec<SyncLogEntry>>,
    ) -> Result<&'a mut Vec<SyncLogEntry>> {
        if cache.is_none() {
            *cache = Some(Self::load(path)?);
        }
        Ok(cache.get_or_insert_with(Vec::new))
    }

    fn load(path: &Path) -> Result<Vec<SyncLogEntry>> {
        match std::fs::read(path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
