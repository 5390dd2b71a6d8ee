//! Sync engine: one explicit instance per process tying together state,
//! journal, echo guard, publisher, scheduler and watcher

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::echo::EchoGuard;
use crate::error::{Result, SyncError};
use crate::inbound::{BatchResult, InboundReceiver};
use crate::journal::{actions, JournalPage, SyncJournal};
use crate::publisher::{HttpPublisher, Publisher};
use crate::queue::{Phase, Scheduler, SyncState};
use crate::types::{ChangeEvent, ChangeSource, SyncConfig};
use crate::watcher::{FileWatcher, IgnoreSet, WatchContext};

/// Capacity of the change channel between producers and the scheduler
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Live status as exposed by `/sync-status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusReport {
    pub enabled: bool,
    pub queue_length: usize,
    pub is_processing: bool,
    pub draining: bool,
    pub phase: Phase,
    pub remote_configured: bool,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub batches_skipped: u64,
    pub last_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Handle to the running engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    state: Arc<SyncState>,
    journal: Arc<SyncJournal>,
    echo: Arc<EchoGuard>,
    publisher: Arc<dyn Publisher>,
    ignore: IgnoreSet,
    changes: mpsc::Sender<ChangeEvent>,
}

impl SyncEngine {
    /// Start the engine with the HTTP publisher described by `config`
    pub fn start(config: SyncConfig) -> Result<Self> {
        let publisher = Arc::new(HttpPublisher::from_config(&config)?);
        Self::start_with_publisher(config, publisher)
    }

    /// Start the engine with a custom publisher. Spawns the scheduler task,
    /// so it must be called inside a tokio runtime.
    pub fn start_with_publisher(config: SyncConfig, publisher: Arc<dyn Publisher>) -> Result<Self> {
        std::fs::create_dir_all(&config.root).map_err(|e| {
            SyncError::Config(format!(
                "Cannot create sync root {}: {}",
                config.root.display(),
                e
            ))
        })?;

        let state = Arc::new(SyncState::new());
        let journal = Arc::new(SyncJournal::new(config.journal_path.clone()));
        let echo = Arc::new(EchoGuard::new(config.echo_window()));
        let (changes, receiver) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);

        if !publisher.is_configured() {
            tracing::warn!("No remote endpoint configured - outbound sync disabled");
        }

        let scheduler = Scheduler::new(
            state.clone(),
            journal.clone(),
            publisher.clone(),
            config.quiet_period(),
        );
        tokio::spawn(scheduler.run(receiver));

        Ok(Self {
            config: Arc::new(config),
            state,
            journal,
            echo,
            publisher,
            ignore: IgnoreSet::default(),
            changes,
        })
    }

    /// Replace the ignore set used by the watcher and file listings
    pub fn with_ignore(mut self, ignore: IgnoreSet) -> Self {
        self.ignore = ignore;
        self
    }

    /// Begin observing the sync root
    pub fn watch(&self) -> Result<FileWatcher> {
        FileWatcher::start(WatchContext::new(
            self.root().to_path_buf(),
            self.state.clone(),
            self.echo.clone(),
            self.ignore.clone(),
            self.changes.clone(),
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn root_buf(&self) -> PathBuf {
        self.config.root.clone()
    }

    pub fn ignore(&self) -> &IgnoreSet {
        &self.ignore
    }

    pub fn journal(&self) -> &SyncJournal {
        &self.journal
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    pub fn set_enabled(&self, enabled: bool) {
        tracing::info!("Sync {}", if enabled { "enabled" } else { "disabled" });
        self.state.set_enabled(enabled);
    }

    pub fn status(&self) -> SyncStatusReport {
        let stats = self.state.stats().snapshot();
        SyncStatusReport {
            enabled: self.state.is_enabled(),
            queue_length: self.state.queue_len(),
            is_processing: self.state.is_processing(),
            draining: self.state.is_draining(),
            phase: self.state.phase(),
            remote_configured: self.publisher.is_configured(),
            batches_sent: stats.batches_sent,
            batches_failed: stats.batches_failed,
            batches_skipped: stats.batches_skipped,
            last_error: stats.last_error,
            timestamp: Utc::now(),
        }
    }

    pub fn recent_log(&self, limit: usize) -> Result<JournalPage> {
        self.journal.recent(limit)
    }

    /// Hand a change to the scheduler
    pub async fn enqueue(&self, change: ChangeEvent) -> Result<()> {
        self.changes
            .send(change)
            .await
            .map_err(|_| SyncError::ChannelClosed("sync queue".to_string()))
    }

    /// Apply inbound operations to the tree.
    ///
    /// Changes from anything other than the remote peer are forwarded
    /// outward through the queue, since echo suppression keeps the watcher
    /// from seeing them.
    pub async fn apply_inbound(&self, files: &[Value], source: ChangeSource) -> BatchResult {
        let receiver = InboundReceiver::new(self.root(), &self.echo, &self.journal);
        let result = receiver.apply_batch(files, source).await;

        if source != ChangeSource::Remote {
            for change in &result.applied {
                if let Err(e) = self.enqueue(change.clone()).await {
                    tracing::error!("Could not forward {}: {}", change.path(), e);
                    break;
                }
            }
        }
        result
    }

    /// Relay a database operation to the remote peer. Best effort: failures
    /// are journaled and returned but never retried.
    pub async fn relay_database_operation(
        &self,
        operation: Value,
        source: ChangeSource,
    ) -> Result<bool> {
        self.journal
            .record(actions::DATABASE_SYNC, source, operation.clone());

        if source == ChangeSource::Remote || !self.publisher.is_configured() {
            return Ok(false);
        }

        let body = json!({
            "event": "database_update",
            "operation": operation,
            "timestamp": Utc::now(),
        });
        match self.publisher.post(body).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::error!("Failed to relay database operation: {}", e);
                self.journal.record(
                    actions::SYNC_ERROR,
                    source,
                    json!({ "error": e.to_string(), "kind": e.kind() }),
                );
                Err(e)
            }
        }
    }
}
