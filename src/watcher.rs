//! File watcher: turns filesystem notifications under the sync root into
//! local [`ChangeEvent`]s
//!
//! Only changes after the watch is established are reported; files present
//! at startup are never replayed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use glob::{MatchOptions, Pattern};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::echo::EchoGuard;
use crate::error::{Result, SyncError};
use crate::inbound::TEMP_SUFFIX;
use crate::queue::SyncState;
use crate::types::{normalize_sync_path, ChangeEvent, ChangeSource};

/// Paths never synchronized: VCS metadata, dependencies, build output,
/// lock files and OS litter
pub const DEFAULT_IGNORE_GLOBS: &[&str] = &[
    "**/.git/**",
    "**/.svn/**",
    "**/.hg/**",
    "**/node_modules/**",
    "**/dist/**",
    "**/build/**",
    "**/*.log",
    "**/*.lock",
    "**/*.lockb",
    "**/package-lock.json",
    "**/pnpm-lock.yaml",
    "**/.DS_Store",
    "**/Thumbs.db",
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled ignore globs, matched against root-relative `/` paths
#[derive(Debug, Clone)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    pub fn new<S: AsRef<str>>(globs: &[S]) -> Result<Self> {
        let patterns = globs
            .iter()
            .map(|g| {
                Pattern::new(g.as_ref())
                    .map_err(|e| SyncError::Config(format!("Bad ignore glob '{}': {}", g.as_ref(), e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Inbound scratch files are always ignored, whatever the globs say
    pub fn is_ignored(&self, relative: &str) -> bool {
        relative.ends_with(TEMP_SUFFIX)
            || self
                .patterns
                .iter()
                .any(|p| p.matches_with(relative, MATCH_OPTIONS))
    }

    /// Whether a directory (and everything below it) is ignored
    pub fn is_ignored_dir(&self, relative: &str) -> bool {
        self.is_ignored(&format!("{}/_", relative))
    }
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_IGNORE_GLOBS
                .iter()
                .filter_map(|g| Pattern::new(g).ok())
                .collect(),
        }
    }
}

/// What a notification says happened to one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    Created,
    Modified,
    Removed,
    /// Rename half the backend could not attribute; resolved by stat
    Moved,
}

/// Flatten a notify event into per-path observations
pub fn observations(event: &Event) -> Vec<(PathBuf, Observed)> {
    let each = |observed: Observed| -> Vec<(PathBuf, Observed)> {
        event.paths.iter().map(|p| (p.clone(), observed)).collect()
    };

    match &event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => each(Observed::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(Observed::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(Observed::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.push((from.clone(), Observed::Removed));
            }
            if let Some(to) = event.paths.get(1) {
                out.push((to.clone(), Observed::Created));
            }
            out
        }
        EventKind::Modify(ModifyKind::Name(_)) => each(Observed::Moved),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => each(Observed::Modified),
        EventKind::Remove(RemoveKind::Folder) => Vec::new(),
        EventKind::Remove(_) => each(Observed::Removed),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Everything needed to turn observations into change events
#[derive(Clone)]
pub struct WatchContext {
    root: PathBuf,
    canonical_root: PathBuf,
    state: Arc<SyncState>,
    echo: Arc<EchoGuard>,
    ignore: IgnoreSet,
    sender: mpsc::Sender<ChangeEvent>,
}

impl WatchContext {
    pub fn new(
        root: PathBuf,
        state: Arc<SyncState>,
        echo: Arc<EchoGuard>,
        ignore: IgnoreSet,
        sender: mpsc::Sender<ChangeEvent>,
    ) -> Self {
        let canonical_root = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        Self {
            root,
            canonical_root,
            state,
            echo,
            ignore,
            sender,
        }
    }

    /// Root-relative normalized path, or `None` for paths outside the root
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let relative = path
            .strip_prefix(&self.canonical_root)
            .or_else(|_| path.strip_prefix(&self.root))
            .ok()?;
        normalize_sync_path(&relative.to_string_lossy()).ok()
    }

    /// Process one raw notification. Returns the number of events emitted.
    pub async fn handle_event(&self, event: Event) -> Result<usize> {
        let mut emitted = 0;
        for (path, observed) in observations(&event) {
            if let Some(change) = self.to_change(&path, observed).await {
                self.sender
                    .send(change)
                    .await
                    .map_err(|_| SyncError::ChannelClosed("sync queue".to_string()))?;
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    async fn to_change(&self, path: &Path, observed: Observed) -> Option<ChangeEvent> {
        let relative = self.relative_path(path)?;
        if self.ignore.is_ignored(&relative) {
            return None;
        }

        if !self.state.is_enabled() {
            tracing::debug!("Sync disabled, discarding change to {}", relative);
            return None;
        }

        let observed = match observed {
            Observed::Moved if path.exists() => Observed::Created,
            Observed::Moved => Observed::Removed,
            other => other,
        };

        match observed {
            Observed::Removed => {
                if path.exists() {
                    // Replaced in place; the create/modify half reports it
                    return None;
                }
                if self.echo.is_echo(&relative, None) {
                    tracing::debug!("Suppressed echo of remote delete: {}", relative);
                    return None;
                }
                tracing::info!("Local delete: {}", relative);
                Some(ChangeEvent::delete(relative, ChangeSource::Local))
            }
            Observed::Created | Observed::Modified | Observed::Moved => {
                match tokio::fs::metadata(path).await {
                    Ok(meta) if meta.is_dir() => return None,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Dropping change to {}: {}", relative, e);
                        return None;
                    }
                }
                let content = match tokio::fs::read(path).await {
                    Ok(content) => content,
                    Err(e) => {
                        tracing::warn!("Dropping change to unreadable {}: {}", relative, e);
                        return None;
                    }
                };
                if self.echo.is_echo(&relative, Some(&content)) {
                    tracing::debug!("Suppressed echo of remote write: {}", relative);
                    return None;
                }

                if observed == Observed::Modified {
                    tracing::info!("Local update: {}", relative);
                    Some(ChangeEvent::update(relative, content, ChangeSource::Local))
                } else {
                    tracing::info!("Local create: {}", relative);
                    Some(ChangeEvent::create(relative, content, ChangeSource::Local))
                }
            }
        }
    }
}

/// Running recursive watch over the sync root
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FileWatcher {
    /// Start watching `context`'s root. Must be called inside a tokio runtime.
    pub fn start(context: WatchContext) -> Result<Self> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        })?;
        watcher.watch(&context.root, RecursiveMode::Recursive)?;
        tracing::info!("Watching {}", context.root.display());

        let task = tokio::spawn(async move {
            let mut prune = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    res = raw_rx.recv() => match res {
                        Some(Ok(event)) => {
                            if let Err(e) = context.handle_event(event).await {
                                tracing::error!("File watcher stopping: {}", e);
                                break;
                            }
                        }
                        Some(Err(e)) => tracing::error!("File watcher error: {}", e),
                        None => break,
                    },
                    _ = prune.tick() => context.echo.prune(),
                }
            }
            tracing::info!("File watcher stopped");
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    /// Stop watching; pending notifications are discarded
    pub fn stop(self) {
        self.task.abort();
    }
}
