//! Core types for treesync

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

// =============================================================================
// Provenance and actions
// =============================================================================

/// Where a change originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    /// Observed by the file watcher
    Local,
    /// Pushed by the remote editing service
    Remote,
    /// Direct API call from anything else (scripts, assistants)
    External,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSource::Local => "local",
            ChangeSource::Remote => "remote",
            ChangeSource::External => "external",
        }
    }

    /// Map a free-form `source` label from an inbound request.
    ///
    /// `lovable` is the name the remote peer historically used for itself.
    pub fn from_label(label: Option<&str>) -> Self {
        match label.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("remote") | Some("lovable") => ChangeSource::Remote,
            Some("local") => ChangeSource::Local,
            _ => ChangeSource::External,
        }
    }
}

impl std::fmt::Display for ChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File-level mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Update,
    Delete,
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileAction::Create => "create",
            FileAction::Update => "update",
            FileAction::Delete => "delete",
        }
    }
}

impl std::str::FromStr for FileAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(FileAction::Create),
            "update" => Ok(FileAction::Update),
            "delete" => Ok(FileAction::Delete),
            _ => Err(format!("Unknown action: {}", s)),
        }
    }
}

// =============================================================================
// Content encoding
// =============================================================================

/// How file content is carried inside JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Utf8,
    Base64,
}

/// Encode raw bytes for the wire. Valid UTF-8 travels as-is, anything else
/// as base64 with an explicit encoding marker.
pub fn encode_content(bytes: &[u8]) -> (String, Option<ContentEncoding>) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), None),
        Err(_) => (
            base64::engine::general_purpose::STANDARD.encode(bytes),
            Some(ContentEncoding::Base64),
        ),
    }
}

/// Decode wire content back into bytes
pub fn decode_content(
    content: &str,
    encoding: Option<ContentEncoding>,
) -> std::result::Result<Vec<u8>, SyncError> {
    match encoding.unwrap_or_default() {
        ContentEncoding::Utf8 => Ok(content.as_bytes().to_vec()),
        ContentEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(content)
            .map_err(|e| SyncError::Internal(format!("Invalid base64 content: {}", e))),
    }
}

// =============================================================================
// Change events
// =============================================================================

/// One file-level mutation with provenance and timestamp.
///
/// Paths are always normalised (see [`normalize_sync_path`]) and relative to
/// the synchronized root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireChange", try_from = "WireChange")]
pub enum ChangeEvent {
    Create {
        path: String,
        content: Vec<u8>,
        source: ChangeSource,
        timestamp: DateTime<Utc>,
    },
    Update {
        path: String,
        content: Vec<u8>,
        source: ChangeSource,
        timestamp: DateTime<Utc>,
    },
    Delete {
        path: String,
        source: ChangeSource,
        timestamp: DateTime<Utc>,
    },
}

impl ChangeEvent {
    pub fn create(path: impl Into<String>, content: Vec<u8>, source: ChangeSource) -> Self {
        ChangeEvent::Create {
            path: path.into(),
            content,
            source,
            timestamp: Utc::now(),
        }
    }

    pub fn update(path: impl Into<String>, content: Vec<u8>, source: ChangeSource) -> Self {
        ChangeEvent::Update {
            path: path.into(),
            content,
            source,
            timestamp: Utc::now(),
        }
    }

    pub fn delete(path: impl Into<String>, source: ChangeSource) -> Self {
        ChangeEvent::Delete {
            path: path.into(),
            source,
            timestamp: Utc::now(),
        }
    }

    /// Build an event from an action; content is ignored for deletes.
    pub fn from_action(
        action: FileAction,
        path: impl Into<String>,
        content: Vec<u8>,
        source: ChangeSource,
    ) -> Self {
        match action {
            FileAction::Create => Self::create(path, content, source),
            FileAction::Update => Self::update(path, content, source),
            FileAction::Delete => Self::delete(path, source),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            ChangeEvent::Create { path, .. }
            | ChangeEvent::Update { path, .. }
            | ChangeEvent::Delete { path, .. } => path,
        }
    }

    pub fn action(&self) -> FileAction {
        match self {
            ChangeEvent::Create { .. } => FileAction::Create,
            ChangeEvent::Update { .. } => FileAction::Update,
            ChangeEvent::Delete { .. } => FileAction::Delete,
        }
    }

    pub fn source(&self) -> ChangeSource {
        match self {
            ChangeEvent::Create { source, .. }
            | ChangeEvent::Update { source, .. }
            | ChangeEvent::Delete { source, .. } => *source,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ChangeEvent::Create { timestamp, .. }
            | ChangeEvent::Update { timestamp, .. }
            | ChangeEvent::Delete { timestamp, .. } => *timestamp,
        }
    }

    pub fn content(&self) -> Option<&[u8]> {
        match self {
            ChangeEvent::Create { content, .. } | ChangeEvent::Update { content, .. } => {
                Some(content)
            }
            ChangeEvent::Delete { .. } => None,
        }
    }
}

/// JSON shape of a [`ChangeEvent`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireChange {
    path: String,
    action: FileAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encoding: Option<ContentEncoding>,
    source: ChangeSource,
    timestamp: DateTime<Utc>,
}

impl From<ChangeEvent> for WireChange {
    fn from(event: ChangeEvent) -> Self {
        let (content, encoding) = match event.content() {
            Some(bytes) => {
                let (text, encoding) = encode_content(bytes);
                (Some(text), encoding)
            }
            None => (None, None),
        };

        WireChange {
            path: event.path().to_string(),
            action: event.action(),
            content,
            encoding,
            source: event.source(),
            timestamp: event.timestamp(),
        }
    }
}

impl TryFrom<WireChange> for ChangeEvent {
    type Error = SyncError;

    fn try_from(wire: WireChange) -> std::result::Result<Self, Self::Error> {
        let path = normalize_sync_path(&wire.path)
            .map_err(|e| SyncError::InvalidPath(format!("{}: {}", wire.path, e)))?;
        let content = match wire.content {
            Some(ref text) => decode_content(text, wire.encoding)?,
            None => Vec::new(),
        };

        let mut event = ChangeEvent::from_action(wire.action, path, content, wire.source);
        match &mut event {
            ChangeEvent::Create { timestamp, .. }
            | ChangeEvent::Update { timestamp, .. }
            | ChangeEvent::Delete { timestamp, .. } => *timestamp = wire.timestamp,
        }
        Ok(event)
    }
}

// =============================================================================
// Inbound operations
// =============================================================================

/// One file operation inside an inbound batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub encoding: Option<ContentEncoding>,
    /// Free-form action; absent means `update`
    #[serde(default)]
    pub action: Option<String>,
}

impl FileOperation {
    pub fn new(path: impl Into<String>, action: FileAction, content: Option<&str>) -> Self {
        Self {
            path: path.into(),
            content: content.map(str::to_string),
            encoding: None,
            action: Some(action.as_str().to_string()),
        }
    }

    /// Parsed action, defaulting to update when absent
    pub fn parsed_action(&self) -> std::result::Result<FileAction, String> {
        match self.action.as_deref() {
            None => Ok(FileAction::Update),
            Some(action) => action.parse(),
        }
    }
}

impl From<&ChangeEvent> for FileOperation {
    fn from(event: &ChangeEvent) -> Self {
        let (content, encoding) = match event.content() {
            Some(bytes) => {
                let (text, encoding) = encode_content(bytes);
                (Some(text), encoding)
            }
            None => (None, None),
        };
        Self {
            path: event.path().to_string(),
            content,
            encoding,
            action: Some(event.action().as_str().to_string()),
        }
    }
}

/// Body accepted by `/webhook` and `/update-files`.
///
/// `files` is kept as raw JSON so one malformed entry fails alone instead of
/// rejecting the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundBatch {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub files: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub source: Option<String>,
}

impl InboundBatch {
    /// Tolerant parse: an empty or malformed body is an empty batch, and a
    /// field of the wrong type is dropped on its own
    pub fn parse(body: &[u8]) -> Self {
        if body.is_empty() {
            return Self::default();
        }
        let value: serde_json::Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Malformed inbound body treated as empty: {}", e);
                return Self::default();
            }
        };

        let text = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
        Self {
            event: text("event"),
            files: value.get("files").and_then(|v| v.as_array()).cloned(),
            source: text("source"),
        }
    }

    /// Whether the body names something this receiver acts on
    pub fn is_recognized(&self) -> bool {
        self.event.as_deref() == Some("push") || self.files.is_some()
    }
}

// =============================================================================
// Paths
// =============================================================================

/// Maximum accepted relative path length
pub const MAX_PATH_LENGTH: usize = 4096;

/// Path validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    Empty,
    TooLong,
    Absolute,
    Traversal,
    InvalidChars,
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathError::Empty => write!(f, "Path cannot be empty"),
            PathError::TooLong => write!(f, "Path exceeds {} characters", MAX_PATH_LENGTH),
            PathError::Absolute => write!(f, "Path must be relative to the sync root"),
            PathError::Traversal => write!(f, "Path cannot contain '..' segments"),
            PathError::InvalidChars => write!(f, "Path contains control characters"),
        }
    }
}

impl std::error::Error for PathError {}

/// Normalize and validate a path relative to the sync root
///
/// Rules:
/// - Backslashes become forward slashes
/// - Empty and `.` segments are dropped
/// - Absolute paths and drive prefixes (`C:`) are rejected
/// - Any `..` segment is rejected, even one that would stay inside the root
pub fn normalize_sync_path(s: &str) -> Result<String, PathError> {
    let unified = s.trim().replace('\\', "/");

    if unified.is_empty() {
        return Err(PathError::Empty);
    }

    if unified.len() > MAX_PATH_LENGTH {
        return Err(PathError::TooLong);
    }

    if unified.chars().any(|c| c.is_control()) {
        return Err(PathError::InvalidChars);
    }

    if unified.starts_with('/') {
        return Err(PathError::Absolute);
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal),
            other => segments.push(other),
        }
    }

    match segments.first() {
        None => return Err(PathError::Empty),
        Some(first) if is_drive_prefix(first) => return Err(PathError::Absolute),
        Some(_) => {}
    }

    Ok(segments.join("/"))
}

fn is_drive_prefix(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

// =============================================================================
// Configuration
// =============================================================================

/// Engine configuration, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Synchronized root directory
    pub root: PathBuf,
    /// Persisted sync log
    #[serde(default = "default_journal_path")]
    pub journal_path: PathBuf,
    /// Remote file-operation endpoint; outbound sync is a no-op without it
    pub remote_url: Option<String>,
    /// Shared secret sent as a bearer credential
    pub secret: Option<String>,
    /// Listening port for the control surface
    #[serde(default = "default_port")]
    pub port: u16,
    /// Quiet period before draining a burst
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
    /// How long an inbound write shadows watcher events for its path
    #[serde(default = "default_echo_window_ms")]
    pub echo_window_ms: u64,
    /// Outbound request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("sync-log.json")
}

fn default_port() -> u16 {
    3001
}

fn default_quiet_period_ms() -> u64 {
    1000
}

fn default_echo_window_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("home"),
            journal_path: default_journal_path(),
            remote_url: None,
            secret: None,
            port: default_port(),
            quiet_period_ms: default_quiet_period_ms(),
            echo_window_ms: default_echo_window_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SyncConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Remote endpoint, treating a blank value as unset
    pub fn remote_endpoint(&self) -> Option<&str> {
        self.remote_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}
