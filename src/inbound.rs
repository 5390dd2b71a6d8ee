//! Inbound receiver: applies file operations pushed by the remote peer (or
//! any other caller) to the local tree
//!
//! Each operation succeeds or fails on its own; one bad entry never discards
//! the rest of the batch.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::echo::EchoGuard;
use crate::error::{Result, SyncError};
use crate::journal::{actions, SyncJournal};
use crate::types::{
    decode_content, encode_content, normalize_sync_path, ChangeEvent, ChangeSource,
    ContentEncoding, FileAction, FileOperation,
};
use crate::watcher::IgnoreSet;

/// Suffix of the scratch files inbound writes go through; never synchronized
pub const TEMP_SUFFIX: &str = ".treesync-tmp";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sibling scratch path for an atomic replace of `target`
fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    target.with_file_name(format!(".{}.{}-{}{}", name, std::process::id(), n, TEMP_SUFFIX))
}

/// Reject `path` if any existing component below `root` is a symlink.
///
/// The last component is checked only when `include_last` is set: a write
/// replaces a symlinked file rather than following it, a read would follow.
async fn ensure_no_symlinks(root: &Path, path: &str, include_last: bool) -> Result<()> {
    let segments: Vec<&str> = path.split('/').collect();
    let checked = if include_last {
        segments.len()
    } else {
        segments.len().saturating_sub(1)
    };

    let mut current = root.to_path_buf();
    for segment in &segments[..checked] {
        current.push(segment);
        match tokio::fs::symlink_metadata(&current).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(SyncError::InvalidPath(format!(
                    "{} passes through a symbolic link",
                    path
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Outcome of one file operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<FileAction>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileResult {
    fn ok(path: &str, action: FileAction, message: String) -> Self {
        Self {
            file_path: path.to_string(),
            action: Some(action),
            success: true,
            message: Some(message),
            error: None,
        }
    }

    fn not_found(path: &str) -> Self {
        Self {
            file_path: path.to_string(),
            action: Some(FileAction::Delete),
            success: false,
            message: Some(format!("File not found: {}", path)),
            error: None,
        }
    }

    fn failed(path: &str, action: Option<FileAction>, error: impl std::fmt::Display) -> Self {
        Self {
            file_path: path.to_string(),
            action,
            success: false,
            message: None,
            error: Some(error.to_string()),
        }
    }
}

/// Aggregate outcome of a batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub success: bool,
    pub results: Vec<FileResult>,
    /// Operations that changed the tree, in order
    #[serde(skip)]
    pub applied: Vec<ChangeEvent>,
}

impl BatchResult {
    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }
}

/// Applies operations under one root
pub struct InboundReceiver<'a> {
    root: &'a Path,
    echo: &'a EchoGuard,
    journal: &'a SyncJournal,
}

impl<'a> InboundReceiver<'a> {
    pub fn new(root: &'a Path, echo: &'a EchoGuard, journal: &'a SyncJournal) -> Self {
        Self {
            root,
            echo,
            journal,
        }
    }

    /// Apply raw JSON operations in order
    pub async fn apply_batch(&self, files: &[Value], source: ChangeSource) -> BatchResult {
        let mut results = Vec::with_capacity(files.len());
        let mut applied = Vec::new();

        for raw in files {
            let (result, change) = self.apply_raw(raw, source).await;
            if let Some(change) = change {
                applied.push(change);
            }
            results.push(result);
        }

        tracing::info!(
            "Applied {} of {} inbound operation(s) from {}",
            applied.len(),
            files.len(),
            source
        );
        BatchResult {
            success: true,
            results,
            applied,
        }
    }

    async fn apply_raw(&self, raw: &Value, source: ChangeSource) -> (FileResult, Option<ChangeEvent>) {
        let label = raw
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let op: FileOperation = match serde_json::from_value(raw.clone()) {
            Ok(op) => op,
            Err(e) => return (FileResult::failed(&label, None, e), None),
        };
        self.apply(&op, source).await
    }

    /// Apply one typed operation
    pub async fn apply(
        &self,
        op: &FileOperation,
        source: ChangeSource,
    ) -> (FileResult, Option<ChangeEvent>) {
        let action = match op.parsed_action() {
            Ok(action) => action,
            Err(e) => return (FileResult::failed(&op.path, None, e), None),
        };
        let path = match normalize_sync_path(&op.path) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Rejected inbound path '{}': {}", op.path, e);
                return (FileResult::failed(&op.path, Some(action), e), None);
            }
        };

        let outcome = match action {
            FileAction::Create | FileAction::Update => self.write(&path, op, action, source).await,
            FileAction::Delete => self.remove(&path, source).await,
        };

        match outcome {
            Ok(Some(change)) => {
                let message = match action {
                    FileAction::Delete => format!("Deleted file: {}", path),
                    _ => format!("Updated file: {}", path),
                };
                (FileResult::ok(&path, action, message), Some(change))
            }
            Ok(None) => (FileResult::not_found(&path), None),
            Err(e) => {
                tracing::warn!("Inbound {} of {} failed: {}", action.as_str(), path, e);
                (FileResult::failed(&path, Some(action), e), None)
            }
        }
    }

    async fn write(
        &self,
        path: &str,
        op: &FileOperation,
        action: FileAction,
        source: ChangeSource,
    ) -> Result<Option<ChangeEvent>> {
        let content = decode_content(op.content.as_deref().unwrap_or_default(), op.encoding)?;
        ensure_no_symlinks(self.root, path, false).await?;
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // The watcher may observe the path at any point until the rename
        // lands, so it stays suppressed until the marker holds the hash
        self.echo.begin_write(path);
        if let Err(e) = replace_file(&full, &content).await {
            self.echo.forget(path);
            return Err(e);
        }
        self.echo.mark_written(path, &content);

        self.journal.record(
            actions::FILE_UPDATED,
            source,
            json!({
                "filePath": path,
                "size": content.len(),
                "action": action.as_str(),
            }),
        );
        Ok(Some(ChangeEvent::from_action(action, path, content, source)))
    }

    async fn remove(&self, path: &str, source: ChangeSource) -> Result<Option<ChangeEvent>> {
        ensure_no_symlinks(self.root, path, false).await?;
        let full = self.root.join(path);
        match tokio::fs::symlink_metadata(&full).await {
            Ok(meta) if meta.is_dir() => {
                return Err(SyncError::InvalidPath(format!("{} is a directory", path)));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        self.echo.mark_removed(path);
        tokio::fs::remove_file(&full).await?;

        self.journal.record(
            actions::FILE_DELETED,
            source,
            json!({ "filePath": path, "size": 0 }),
        );
        Ok(Some(ChangeEvent::delete(path, source)))
    }
}

/// Write `content` to a sibling scratch file and rename it over `target`,
/// so the target only ever holds the old or the new bytes
async fn replace_file(target: &Path, content: &[u8]) -> Result<()> {
    let temp = temp_path_for(target);
    if let Err(e) = tokio::fs::write(&temp, content).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&temp, target).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

// =============================================================================
// Tree inspection
// =============================================================================

/// File content as returned by `/read-file`
#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<ContentEncoding>,
    pub size: u64,
}

/// Read one file under `root`; `Ok(None)` when it does not exist
pub async fn read_file(root: &Path, path: &str) -> Result<Option<FileContent>> {
    let path = normalize_sync_path(path).map_err(|e| SyncError::InvalidPath(e.to_string()))?;
    ensure_no_symlinks(root, &path, true).await?;
    let bytes = match tokio::fs::read(root.join(&path)).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let (content, encoding) = encode_content(&bytes);
    Ok(Some(FileContent {
        path,
        content,
        encoding,
        size: bytes.len() as u64,
    }))
}

/// One entry of `/list-files`
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Recursively list files below `directory` (root-relative, may be empty),
/// skipping ignored paths. Sorted by path.
pub fn list_files(root: &Path, directory: &str, ignore: &IgnoreSet) -> Result<Vec<FileEntry>> {
    let start = if directory.trim().is_empty() || directory.trim() == "." {
        String::new()
    } else {
        normalize_sync_path(directory).map_err(|e| SyncError::InvalidPath(e.to_string()))?
    };

    let mut files = Vec::new();
    let mut pending: Vec<(PathBuf, String)> = vec![(root.join(&start), start)];

    while let Some((dir, relative)) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let child = if relative.is_empty() {
                name
            } else {
                format!("{}/{}", relative, name)
            };

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if !ignore.is_ignored_dir(&child) {
                    pending.push((entry.path(), child));
                }
            } else if file_type.is_file() && !ignore.is_ignored(&child) {
                let meta = entry.metadata()?;
                files.push(FileEntry {
                    path: child,
                    size: meta.len(),
                    modified: meta.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}
