//! Outbound publisher: delivers batches of local changes to the remote peer
//!
//! Delivery is at-most-once. A failed or timed-out POST is journaled as
//! `sync_error` and the batch is discarded; nothing is retried or requeued.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{Result, SyncError};
use crate::journal::{actions, SyncJournal};
use crate::types::{ChangeEvent, ChangeSource, SyncConfig};

/// Event marker carried by every outbound batch
pub const OUTBOUND_EVENT: &str = "sync_from_local";

/// Body of one outbound POST
#[derive(Debug, Serialize)]
pub struct OutboundBatch<'a> {
    pub event: &'static str,
    pub files: &'a [ChangeEvent],
    pub timestamp: DateTime<Utc>,
}

impl<'a> OutboundBatch<'a> {
    pub fn new(files: &'a [ChangeEvent]) -> Self {
        Self {
            event: OUTBOUND_EVENT,
            files,
            timestamp: Utc::now(),
        }
    }
}

/// Transport to the remote file-operation endpoint
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Whether a remote endpoint exists at all
    fn is_configured(&self) -> bool;

    /// POST one JSON body and return the parsed response body
    async fn post(&self, body: Value) -> Result<Value>;
}

/// What happened to one batch
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// No endpoint configured; nothing was sent
    NotConfigured,
    Sent { files: usize, response: Value },
    Failed { error: String },
}

impl PublishOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, PublishOutcome::Sent { .. })
    }
}

/// reqwest-backed publisher
pub struct HttpPublisher {
    client: reqwest::Client,
    endpoint: Option<String>,
    secret: Option<String>,
}

impl HttpPublisher {
    pub fn new(endpoint: Option<String>, secret: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.filter(|url| !url.trim().is_empty()),
            secret: secret.filter(|s| !s.is_empty()),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Self::new(
            config.remote_endpoint().map(str::to_string),
            config.secret.clone(),
            config.request_timeout(),
        )
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    async fn post(&self, body: Value) -> Result<Value> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| SyncError::Config("Remote endpoint not configured".to_string()))?;

        let mut request = self.client.post(endpoint).json(&body);
        if let Some(ref secret) = self.secret {
            request = request.bearer_auth(secret);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(SyncError::Remote {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Send one batch and journal the result
pub async fn publish_batch(
    publisher: &dyn Publisher,
    journal: &SyncJournal,
    batch: &[ChangeEvent],
) -> PublishOutcome {
    if !publisher.is_configured() {
        tracing::warn!(
            "Remote endpoint not configured - dropping batch of {} change(s)",
            batch.len()
        );
        return PublishOutcome::NotConfigured;
    }

    let body = match serde_json::to_value(OutboundBatch::new(batch)) {
        Ok(body) => body,
        Err(e) => return fail(journal, batch.len(), SyncError::from(e)),
    };

    tracing::info!("Sending {} change(s) to remote", batch.len());
    match publisher.post(body).await {
        Ok(response) => {
            journal.record(
                actions::SENT_TO_REMOTE,
                ChangeSource::Local,
                json!({
                    "filesCount": batch.len(),
                    "paths": batch.iter().map(ChangeEvent::path).collect::<Vec<_>>(),
                    "result": response,
                }),
            );
            PublishOutcome::Sent {
                files: batch.len(),
                response,
            }
        }
        Err(e) => fail(journal, batch.len(), e),
    }
}

fn fail(journal: &SyncJournal, files: usize, error: SyncError) -> PublishOutcome {
    tracing::error!("Failed to send {} change(s) to remote: {}", files, error);
    journal.record(
        actions::SYNC_ERROR,
        ChangeSource::Local,
        json!({
            "error": error.to_string(),
            "kind": error.kind(),
            "retryable": error.is_retryable(),
            "filesCount": files,
        }),
    );
    PublishOutcome::Failed {
        error: error.to_string(),
    }
}
