//! Sync queue and debounce scheduler
//!
//! Producers (watcher, API forwarding) never touch the queue directly: they
//! send [`ChangeEvent`]s down a channel to the single scheduler task, which
//! owns enqueueing, draining and publishing.
//!
//! ```text
//! IDLE --enqueue--> PENDING --quiet period--> DRAINING --queue empty--> IDLE
//!                                                 |
//!                                                 +--queue non-empty--> DRAINING
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::journal::SyncJournal;
use crate::publisher::{publish_batch, PublishOutcome, Publisher};
use crate::types::ChangeEvent;

/// Scheduler phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Pending,
    Draining,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Pending,
            2 => Phase::Draining,
            _ => Phase::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Pending => 1,
            Phase::Draining => 2,
        }
    }
}

/// Counters over publish outcomes
#[derive(Debug, Default)]
pub struct PublishStats {
    sent: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time copy of [`PublishStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishStatsSnapshot {
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub batches_skipped: u64,
    pub last_error: Option<String>,
}

impl PublishStats {
    pub fn record(&self, outcome: &PublishOutcome) {
        match outcome {
            PublishOutcome::Sent { .. } => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            PublishOutcome::NotConfigured => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            PublishOutcome::Failed { error } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(error.clone());
            }
        }
    }

    pub fn snapshot(&self) -> PublishStatsSnapshot {
        PublishStatsSnapshot {
            batches_sent: self.sent.load(Ordering::Relaxed),
            batches_failed: self.failed.load(Ordering::Relaxed),
            batches_skipped: self.skipped.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Live engine state: the `enabled` flag, the queue and the scheduler phase.
///
/// Process-lifetime only; an in-flight queue is lost on exit.
#[derive(Debug)]
pub struct SyncState {
    enabled: AtomicBool,
    queue: Mutex<Vec<ChangeEvent>>,
    phase: AtomicU8,
    stats: PublishStats,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            queue: Mutex::new(Vec::new()),
            phase: AtomicU8::new(Phase::Idle.as_u8()),
            stats: PublishStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_draining(&self) -> bool {
        self.phase() == Phase::Draining
    }

    /// A drain is scheduled or running
    pub fn is_processing(&self) -> bool {
        self.phase() != Phase::Idle
    }

    pub fn stats(&self) -> &PublishStats {
        &self.stats
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    fn enqueue(&self, event: ChangeEvent) {
        tracing::debug!(
            "Queued {} {} ({})",
            event.action().as_str(),
            event.path(),
            event.source()
        );
        self.queue.lock().push(event);
    }

    /// Snapshot-and-clear in one step so later events land in the next batch
    fn take_batch(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.queue.lock())
    }
}

/// The single consumer of the change channel
pub struct Scheduler {
    state: Arc<SyncState>,
    journal: Arc<SyncJournal>,
    publisher: Arc<dyn Publisher>,
    quiet_period: Duration,
}

impl Scheduler {
    pub fn new(
        state: Arc<SyncState>,
        journal: Arc<SyncJournal>,
        publisher: Arc<dyn Publisher>,
        quiet_period: Duration,
    ) -> Self {
        Self {
            state,
            journal,
            publisher,
            quiet_period,
        }
    }

    /// Run until every sender is dropped, then flush what is left
    pub async fn run(self, mut receiver: mpsc::Receiver<ChangeEvent>) {
        let mut open = true;

        loop {
            if self.state.queue_len() == 0 {
                if !open {
                    break;
                }
                match receiver.recv().await {
                    Some(event) => self.state.enqueue(event),
                    None => break,
                }
            }

            // Quiet period runs from the first event of the burst
            self.state.set_phase(Phase::Pending);
            let deadline = Instant::now() + self.quiet_period;
            let quiet = tokio::time::sleep_until(deadline);
            tokio::pin!(quiet);
            while open {
                tokio::select! {
                    biased;
                    _ = &mut quiet => break,
                    event = receiver.recv() => match event {
                        Some(event) => self.state.enqueue(event),
                        None => open = false,
                    },
                }
            }

            loop {
                self.state.set_phase(Phase::Draining);
                let batch = self.state.take_batch();
                if batch.is_empty() {
                    break;
                }

                let send = publish_batch(self.publisher.as_ref(), &self.journal, &batch);
                tokio::pin!(send);
                let outcome = loop {
                    tokio::select! {
                        outcome = &mut send => break outcome,
                        event = receiver.recv(), if open => match event {
                            Some(event) => self.state.enqueue(event),
                            None => open = false,
                        },
                    }
                };
                self.state.stats.record(&outcome);

                // Anything queued during the send is already coalesced work
                if self.state.queue_len() == 0 {
                    break;
                }
                tracing::debug!(
                    "{} change(s) arrived during send, draining again",
                    self.state.queue_len()
                );
            }
            self.state.set_phase(Phase::Idle);
        }

        tracing::info!("Sync scheduler stopped");
    }
}
