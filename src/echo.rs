//! Echo suppression between inbound writes and the file watcher
//!
//! Every write applied by the inbound receiver leaves a short-lived marker
//! keyed by path. When the watcher later observes that path, it consults the
//! marker: while a write is in flight every event for the path is dropped;
//! once it lands, an event inside the window whose on-disk state still
//! matches what was applied is the echo of our own write and is dropped too.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

/// What the inbound receiver left on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedState {
    /// Write started but not yet complete; content on disk is undefined
    InFlight,
    /// File written with content of this hash
    Written(String),
    /// File removed
    Removed,
}

#[derive(Debug, Clone)]
struct Marker {
    state: AppliedState,
    applied_at: Instant,
}

/// Path-keyed markers of recent inbound writes
#[derive(Debug)]
pub struct EchoGuard {
    markers: DashMap<String, Marker>,
    window: Duration,
}

/// Content hash used to compare applied and observed state
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl EchoGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            markers: DashMap::new(),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record that a write to `path` is starting. Every observation of the
    /// path is an echo until [`mark_written`](Self::mark_written) or
    /// [`forget`](Self::forget) is called.
    pub fn begin_write(&self, path: &str) {
        self.mark(path, AppliedState::InFlight);
    }

    /// Drop the marker for `path`, e.g. after a failed write
    pub fn forget(&self, path: &str) {
        self.markers.remove(path);
    }

    /// Record that `path` was just written with `content`
    pub fn mark_written(&self, path: &str, content: &[u8]) {
        self.mark(path, AppliedState::Written(content_hash(content)));
    }

    /// Record that `path` was just removed
    pub fn mark_removed(&self, path: &str) {
        self.mark(path, AppliedState::Removed);
    }

    fn mark(&self, path: &str, state: AppliedState) {
        self.markers.insert(
            path.to_string(),
            Marker {
                state,
                applied_at: Instant::now(),
            },
        );
    }

    /// Decide whether a watcher observation of `path` is an echo.
    ///
    /// `observed` is the file content now on disk, or `None` if the file is
    /// gone. Expired markers are removed on the way.
    pub fn is_echo(&self, path: &str, observed: Option<&[u8]>) -> bool {
        let Some(marker) = self.markers.get(path).map(|m| m.clone()) else {
            return false;
        };

        if marker.state == AppliedState::InFlight {
            return true;
        }

        if marker.applied_at.elapsed() > self.window {
            self.markers
                .remove_if(path, |_, m| m.applied_at == marker.applied_at);
            return false;
        }

        match (&marker.state, observed) {
            (AppliedState::Written(hash), Some(bytes)) => *hash == content_hash(bytes),
            (AppliedState::Removed, None) => true,
            _ => false,
        }
    }

    /// Drop markers older than the window
    pub fn prune(&self) {
        let window = self.window;
        self.markers
            .retain(|_, m| m.state == AppliedState::InFlight || m.applied_at.elapsed() <= window);
    }

    /// Markers currently held
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}
