//! HTTP control surface: webhook receiver, file endpoints, status, log and
//! the enable toggle

use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::inbound::{list_files, read_file};
use crate::journal::{actions, DEFAULT_QUERY_LIMIT};
use crate::types::{ChangeSource, InboundBatch};

/// Request bodies carry whole files
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// HTTP server in front of a [`SyncEngine`]
pub struct SyncServer {
    engine: SyncEngine,
    addr: SocketAddr,
}

impl SyncServer {
    pub fn new(engine: SyncEngine, port: u16) -> Self {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        Self { engine, addr }
    }

    /// Build the router
    pub fn router(engine: SyncEngine) -> Router {
        Router::new()
            .route("/", get(help_handler))
            .route("/help", get(help_handler))
            .route("/health", get(health_handler))
            .route("/webhook", get(webhook_info_handler).post(webhook_handler))
            .route("/update-files", post(update_files_handler))
            .route("/update-file", post(update_file_handler))
            .route("/read-file", get(read_file_handler))
            .route("/list-files", get(list_files_handler))
            .route("/sync-status", get(status_handler))
            .route("/sync-log", get(log_handler))
            .route("/sync-enable", post(enable_handler))
            .route("/database-sync", post(database_sync_handler))
            .fallback(not_found_handler)
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(engine)
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = Self::router(self.engine);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("Sync server listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// 200 with the body's fields plus `success: true`
fn success<T: Serialize>(body: T) -> Response {
    let mut value = serde_json::to_value(body).unwrap_or_else(|_| json!({}));
    if let Value::Object(ref mut map) = value {
        map.insert("success".to_string(), Value::Bool(true));
    }
    (StatusCode::OK, Json(value)).into_response()
}

fn failure(status: StatusCode, error: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": error.to_string() })),
    )
        .into_response()
}

fn error_status(error: &SyncError) -> StatusCode {
    match error {
        SyncError::InvalidPath(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn help_handler() -> Response {
    success(json!({
        "service": "treesync",
        "version": crate::VERSION,
        "endpoints": [
            "POST /webhook",
            "POST /update-files",
            "POST /update-file",
            "GET /read-file?path=",
            "GET /list-files?directory=",
            "GET /sync-status",
            "GET /sync-log?limit=50",
            "POST /sync-enable?enabled=true|false",
            "POST /database-sync",
        ],
    }))
}

async fn health_handler() -> Response {
    success(json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    failure(StatusCode::NOT_FOUND, "Not Found")
}

async fn webhook_info_handler(State(engine): State<SyncEngine>) -> Response {
    success(json!({
        "endpoint": "/webhook",
        "method": "POST",
        "contentType": "application/json",
        "example": { "event": "push", "files": [{ "path": "src/App.tsx", "content": "...", "action": "update" }] },
        "enabled": engine.is_enabled(),
        "queueLength": engine.state().queue_len(),
    }))
}

/// Pushes from the remote peer. Tolerant: malformed bodies apply nothing.
async fn webhook_handler(State(engine): State<SyncEngine>, body: Bytes) -> Response {
    let batch = InboundBatch::parse(&body);
    let recognized = batch.is_recognized();
    let files = batch.files.unwrap_or_default();
    tracing::info!("Webhook received with {} file(s)", files.len());

    engine.journal().record(
        actions::WEBHOOK_RECEIVED,
        ChangeSource::Remote,
        json!({ "event": batch.event, "filesCount": files.len() }),
    );

    if !recognized {
        return success(json!({ "message": "Webhook received" }));
    }

    let result = engine.apply_inbound(&files, ChangeSource::Remote).await;
    success(result)
}

/// Direct batch updates from scripts and assistants
async fn update_files_handler(State(engine): State<SyncEngine>, body: Bytes) -> Response {
    let batch = InboundBatch::parse(&body);
    let Some(files) = batch.files else {
        return failure(StatusCode::BAD_REQUEST, "files must be provided as an array");
    };
    let source = ChangeSource::from_label(batch.source.as_deref());
    tracing::info!("Updating {} file(s) from {}", files.len(), source);

    let result = engine.apply_inbound(&files, source).await;
    engine.journal().record(
        actions::FILES_UPDATED,
        source,
        json!({ "filesCount": files.len(), "failures": result.failures() }),
    );
    success(result)
}

#[derive(Debug, Deserialize)]
struct SingleFileBody {
    path: Option<String>,
    content: Option<String>,
    encoding: Option<Value>,
    source: Option<String>,
}

async fn update_file_handler(State(engine): State<SyncEngine>, body: Bytes) -> Response {
    let parsed: Option<SingleFileBody> = serde_json::from_slice(&body).ok();
    let Some(SingleFileBody {
        path: Some(path),
        content,
        encoding,
        source,
    }) = parsed
    else {
        return failure(StatusCode::BAD_REQUEST, "path is required");
    };

    let op = json!({
        "path": path,
        "content": content.unwrap_or_default(),
        "encoding": encoding,
        "action": "update",
    });
    let source = ChangeSource::from_label(source.as_deref());
    let mut result = engine.apply_inbound(std::slice::from_ref(&op), source).await;

    match result.results.pop() {
        Some(file) => success(file),
        None => failure(StatusCode::INTERNAL_SERVER_ERROR, "no result"),
    }
}

#[derive(Debug, Deserialize)]
struct ReadFileQuery {
    path: Option<String>,
}

async fn read_file_handler(
    State(engine): State<SyncEngine>,
    Query(query): Query<ReadFileQuery>,
) -> Response {
    let Some(path) = query.path.filter(|p| !p.is_empty()) else {
        return failure(StatusCode::BAD_REQUEST, "path is required");
    };

    match read_file(engine.root(), &path).await {
        Ok(Some(file)) => success(file),
        Ok(None) => Json(json!({
            "success": false,
            "message": format!("File not found: {}", path),
        }))
        .into_response(),
        Err(e) => failure(error_status(&e), e),
    }
}

#[derive(Debug, Deserialize)]
struct ListFilesQuery {
    directory: Option<String>,
}

async fn list_files_handler(
    State(engine): State<SyncEngine>,
    Query(query): Query<ListFilesQuery>,
) -> Response {
    let root = engine.root_buf();
    let ignore = engine.ignore().clone();
    let directory = query.directory.unwrap_or_default();

    let listed =
        tokio::task::spawn_blocking(move || list_files(&root, &directory, &ignore)).await;

    match listed {
        Ok(Ok(files)) => success(json!({ "count": files.len(), "files": files })),
        Ok(Err(SyncError::Io(e))) if e.kind() == std::io::ErrorKind::NotFound => Json(json!({
            "success": false,
            "message": "Directory not found",
        }))
        .into_response(),
        Ok(Err(e)) => failure(error_status(&e), e),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn status_handler(State(engine): State<SyncEngine>) -> Response {
    success(engine.status())
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    limit: Option<String>,
}

async fn log_handler(State(engine): State<SyncEngine>, Query(query): Query<LogQuery>) -> Response {
    let limit = query
        .limit
        .and_then(|l| l.trim().parse::<usize>().ok())
        .filter(|&l| l > 0)
        .unwrap_or(DEFAULT_QUERY_LIMIT);

    match engine.recent_log(limit) {
        Ok(page) => success(page),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Debug, Deserialize)]
struct EnableQuery {
    enabled: Option<String>,
}

async fn enable_handler(
    State(engine): State<SyncEngine>,
    Query(query): Query<EnableQuery>,
) -> Response {
    let enabled = query.enabled.as_deref() == Some("true");
    engine.set_enabled(enabled);

    success(json!({
        "enabled": engine.is_enabled(),
        "message": if enabled { "Sync enabled" } else { "Sync disabled" },
    }))
}

#[derive(Debug, Deserialize)]
struct DatabaseSyncBody {
    operation: Option<Value>,
    source: Option<String>,
}

async fn database_sync_handler(State(engine): State<SyncEngine>, body: Bytes) -> Response {
    let parsed: Option<DatabaseSyncBody> = serde_json::from_slice(&body).ok();
    let Some(DatabaseSyncBody {
        operation: Some(operation),
        source,
    }) = parsed
    else {
        return failure(StatusCode::BAD_REQUEST, "operation is required");
    };

    let source = ChangeSource::from_label(source.as_deref());
    let kind = operation
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    tracing::info!("Database sync: {} from {}", kind, source);

    let relayed = engine
        .relay_database_operation(operation.clone(), source)
        .await
        .unwrap_or(false);

    success(json!({
        "message": format!("Database sync: {}", kind),
        "operation": operation,
        "relayed": relayed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::publisher::Publisher;
    use crate::types::SyncConfig;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Unconfigured;

    #[async_trait]
    impl Publisher for Unconfigured {
        fn is_configured(&self) -> bool {
            false
        }

        async fn post(&self, _body: Value) -> Result<Value> {
            Err(SyncError::Config("unset".into()))
        }
    }

    fn engine(dir: &TempDir) -> SyncEngine {
        let config = SyncConfig {
            root: dir.path().join("home"),
            journal_path: dir.path().join("sync-log.json"),
            quiet_period_ms: 20,
            ..Default::default()
        };
        SyncEngine::start_with_publisher(config, Arc::new(Unconfigured)).unwrap()
    }

    async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_status_reflects_state() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let app = SyncServer::router(engine.clone());

        let (status, body) = call(app, "GET", "/sync-status", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["enabled"], true);
        assert_eq!(body["queueLength"], 0);
        assert_eq!(body["isProcessing"], false);
        assert_eq!(body["remoteConfigured"], false);
    }

    #[tokio::test]
    async fn test_enable_toggle() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let (_, body) = call(SyncServer::router(engine.clone()), "POST", "/sync-enable?enabled=false", "").await;
        assert_eq!(body["enabled"], false);
        assert!(!engine.is_enabled());

        let (_, body) = call(SyncServer::router(engine.clone()), "POST", "/sync-enable?enabled=true", "").await;
        assert_eq!(body["enabled"], true);
        assert!(engine.is_enabled());

        // Anything other than "true" disables
        call(SyncServer::router(engine.clone()), "POST", "/sync-enable?enabled=yes", "").await;
        assert!(!engine.is_enabled());
    }

    #[tokio::test]
    async fn test_webhook_applies_files() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let body = r#"{"event":"push","files":[{"path":"src/App.tsx","content":"app","action":"update"}]}"#;

        let (status, resp) = call(SyncServer::router(engine.clone()), "POST", "/webhook", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["success"], true);
        assert_eq!(resp["results"][0]["filePath"], "src/App.tsx");
        assert_eq!(resp["results"][0]["success"], true);
        assert_eq!(
            std::fs::read_to_string(engine.root().join("src/App.tsx")).unwrap(),
            "app"
        );

        let page = engine.recent_log(10).unwrap();
        let tags: Vec<&str> = page.logs.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(tags, vec![actions::FILE_UPDATED, actions::WEBHOOK_RECEIVED]);
    }

    #[tokio::test]
    async fn test_webhook_tolerates_garbage() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let (status, resp) = call(SyncServer::router(engine.clone()), "POST", "/webhook", "{oops").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["success"], true);

        let (_, resp) = call(SyncServer::router(engine), "POST", "/webhook", r#"{"event":"push"}"#).await;
        assert_eq!(resp["success"], true);
        assert_eq!(resp["results"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_update_files_requires_array() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let (status, resp) = call(SyncServer::router(engine), "POST", "/update-files", "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp["success"], false);
    }

    #[tokio::test]
    async fn test_single_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let (status, resp) = call(
            SyncServer::router(engine.clone()),
            "POST",
            "/update-file",
            r#"{"path":"notes/today.md","content":"hi"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["filePath"], "notes/today.md");

        let (_, resp) = call(SyncServer::router(engine.clone()), "GET", "/read-file?path=notes/today.md", "").await;
        assert_eq!(resp["content"], "hi");
        assert_eq!(resp["size"], 2);

        let (_, resp) = call(SyncServer::router(engine.clone()), "GET", "/list-files", "").await;
        assert_eq!(resp["count"], 1);
        assert_eq!(resp["files"][0]["path"], "notes/today.md");

        let (status, _) = call(SyncServer::router(engine), "GET", "/read-file?path=../etc/passwd", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_log_query_limit() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        for i in 0..60 {
            engine
                .journal()
                .record(actions::FILE_UPDATED, ChangeSource::Remote, json!({ "n": i }));
        }

        let (_, resp) = call(SyncServer::router(engine.clone()), "GET", "/sync-log", "").await;
        assert_eq!(resp["logs"].as_array().unwrap().len(), DEFAULT_QUERY_LIMIT);
        assert_eq!(resp["total"], 60);
        assert_eq!(resp["logs"][0]["data"]["n"], 59);

        let (_, resp) = call(SyncServer::router(engine), "GET", "/sync-log?limit=5", "").await;
        assert_eq!(resp["logs"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_database_sync() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let (status, _) = call(SyncServer::router(engine.clone()), "POST", "/database-sync", "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, resp) = call(
            SyncServer::router(engine.clone()),
            "POST",
            "/database-sync",
            r#"{"operation":{"type":"add_user","table":"users"},"source":"ai"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["relayed"], false);
        assert_eq!(engine.recent_log(1).unwrap().logs[0].action, actions::DATABASE_SYNC);
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let (status, resp) = call(SyncServer::router(engine(&dir)), "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["success"], true);
        assert_eq!(resp["status"], "ok");
    }

    #[tokio::test]
    async fn test_update_files_ignores_mistyped_fields() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let body = r#"{"source":1,"event":7,"files":[{"path":"a.txt","content":"kept"}]}"#;

        let (status, resp) = call(SyncServer::router(engine.clone()), "POST", "/update-files", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["results"][0]["success"], true);
        assert_eq!(std::fs::read_to_string(engine.root().join("a.txt")).unwrap(), "kept");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let dir = TempDir::new().unwrap();
        let (status, resp) = call(SyncServer::router(engine(&dir)), "GET", "/nope", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(resp["success"], false);
    }
}
