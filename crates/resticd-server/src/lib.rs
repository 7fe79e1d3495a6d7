//! HTTP surface of resticd.

pub mod config;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use resticd_common::{sanitize_message, BackupError, MESSAGE_LIMIT};
use resticd_engine::RetentionPolicy;
use resticd_orchestrator::{CreateBackup, Dispatch, Orchestrator, RepoTarget};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    api_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, api_token: Option<String>) -> Self {
        Self {
            orchestrator,
            api_token: api_token.map(Arc::from),
        }
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub error: String,
    pub code: String,
}

impl ApiError {
    fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error: message.to_string(),
            code: "UNAUTHORIZED".to_string(),
        }
    }
}

pub fn status_for(err: &BackupError) -> StatusCode {
    match err {
        BackupError::InvalidRequest(_) | BackupError::MissingKey | BackupError::InvalidPath(_) => {
            StatusCode::BAD_REQUEST
        }
        BackupError::Conflict(_) => StatusCode::CONFLICT,
        BackupError::CapacityExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
        BackupError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        BackupError::NotFound(_) => StatusCode::NOT_FOUND,
        BackupError::ToolFailure(_) | BackupError::Io(_) | BackupError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<BackupError> for ApiError {
    fn from(err: BackupError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!(code = err.code(), error = %err, "Request failed");
        }
        Self {
            status,
            error: sanitize_message(&err.to_string(), None, MESSAGE_LIMIT),
            code: err.code().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// --- Request types ---

/// Repository selectors accepted in the query string or the JSON body.
#[derive(Debug, Default, Deserialize)]
pub struct RepoParams {
    pub owner_username: Option<String>,
    pub encryption_key: Option<String>,
    #[serde(rename = "async")]
    pub detach: Option<String>,
}

impl RepoParams {
    fn detach(&self) -> bool {
        self.detach
            .as_deref()
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateBackupRequest {
    pub owner_username: Option<String>,
    pub encryption_key: Option<String>,
    pub max_snapshots: Option<u64>,
    pub max_size_bytes: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct KeyBody {
    pub owner_username: Option<String>,
    pub encryption_key: Option<String>,
}

/// Body values win over query values.
fn repo_target(server: String, query: &RepoParams, owner: Option<String>, key: Option<String>) -> RepoTarget {
    let owner = owner
        .or_else(|| query.owner_username.clone())
        .filter(|o| !o.trim().is_empty());
    let key = key
        .or_else(|| query.encryption_key.clone())
        .filter(|k| !k.is_empty());
    RepoTarget {
        server_id: server,
        owner,
        key,
    }
}

fn body_target(server: String, query: &RepoParams, body: Option<Json<KeyBody>>) -> RepoTarget {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    repo_target(server, query, body.owner_username, body.encryption_key)
}

// --- Router ---

pub fn create_app(state: AppState) -> Router {
    let restic = "/api/servers/:server/backups/restic";
    let api = Router::new()
        .route(restic, post(create_backup_handler).get(list_backups_handler))
        .route(&format!("{restic}/status"), get(backup_status_handler))
        .route(&format!("{restic}/stats"), get(stats_handler))
        .route(&format!("{restic}/repo"), delete(delete_repository_handler))
        .route(&format!("{restic}/restore/status"), get(restore_status_handler))
        .route(&format!("{restic}/:backup"), delete(delete_backup_handler))
        .route(&format!("{restic}/:backup/lock"), post(lock_handler))
        .route(&format!("{restic}/:backup/unlock"), post(unlock_handler))
        .route(&format!("{restic}/:backup/restore"), post(restore_handler))
        .route(&format!("{restic}/:backup/prepare"), post(prepare_handler))
        .route(&format!("{restic}/:backup/prepare/status"), get(prepare_status_handler))
        .route(&format!("{restic}/:backup/download"), get(download_handler))
        .route("/api/restic/archives", get(list_archives_handler))
        .route("/api/restic/archives/:archive", delete(delete_archive_handler))
        .route("/api/restic/archives/:archive/download", get(download_archive_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .merge(api)
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Authentication middleware
async fn authenticate(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

    if presented != expected {
        warn!("Rejected request with invalid bearer token");
        return Err(ApiError::unauthorized("Invalid bearer token"));
    }
    Ok(next.run(request).await)
}

// --- Backup handlers ---

async fn create_backup_handler(
    State(state): State<AppState>,
    Path(server): Path<String>,
    Query(query): Query<RepoParams>,
    body: Option<Json<CreateBackupRequest>>,
) -> ApiResult<Response> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let detach = query.detach();
    let request = CreateBackup {
        target: repo_target(server, &query, body.owner_username, body.encryption_key),
        policy: RetentionPolicy {
            max_snapshots: body.max_snapshots,
            max_repo_bytes: body.max_size_bytes,
        },
        tags: body.tags,
        detach,
    };

    match state.orchestrator.create_backup(request).await? {
        Dispatch::Started(record) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "message": "backup started", "status": record })),
        )
            .into_response()),
        Dispatch::Finished(created) => Ok(Json(json!({
            "message": "backup created",
            "snapshot_id": created.snapshot_id,
            "pruned": created.pruned,
            "summary": created.summary,
        }))
        .into_response()),
    }
}

async fn list_backups_handler(
    State(state): State<AppState>,
    Path(server): Path<String>,
    Query(query): Query<RepoParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let target = repo_target(server, &query, None, None);
    let backups = state.orchestrator.list_backups(&target).await?;
    Ok(Json(json!({ "backups": backups })))
}

async fn backup_status_handler(
    State(state): State<AppState>,
    Path(server): Path<String>,
    Query(query): Query<RepoParams>,
) -> ApiResult<Response> {
    let target = repo_target(server, &query, None, None);
    Ok(Json(state.orchestrator.backup_status(&target).await?).into_response())
}

async fn stats_handler(
    State(state): State<AppState>,
    Path(server): Path<String>,
    Query(query): Query<RepoParams>,
) -> ApiResult<Response> {
    let target = repo_target(server, &query, None, None);
    Ok(Json(state.orchestrator.repository_stats(&target).await?).into_response())
}

async fn delete_repository_handler(
    State(state): State<AppState>,
    Path(server): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = state.orchestrator.delete_repository(&server).await?;
    Ok(Json(json!({ "message": "repo deleted", "deleted": deleted })))
}

async fn lock_handler(
    State(state): State<AppState>,
    Path((server, backup)): Path<(String, String)>,
    Query(query): Query<RepoParams>,
    body: Option<Json<KeyBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let target = body_target(server, &query, body);
    let lock = state.orchestrator.lock_backup(&target, &backup).await?;
    Ok(Json(json!({ "message": "locked", "snapshot_id": lock.snapshot_id })))
}

async fn unlock_handler(
    State(state): State<AppState>,
    Path((server, backup)): Path<(String, String)>,
    Query(query): Query<RepoParams>,
    body: Option<Json<KeyBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let target = body_target(server, &query, body);
    let lock = state.orchestrator.unlock_backup(&target, &backup).await?;
    Ok(Json(json!({ "message": "unlocked", "snapshot_id": lock.snapshot_id })))
}

async fn delete_backup_handler(
    State(state): State<AppState>,
    Path((server, backup)): Path<(String, String)>,
    Query(query): Query<RepoParams>,
    body: Option<Json<KeyBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let target = body_target(server, &query, body);
    let snapshot_id = state.orchestrator.delete_backup(&target, &backup).await?;
    Ok(Json(json!({ "message": "backup deleted", "snapshot_id": snapshot_id })))
}

// --- Restore handlers ---

async fn restore_handler(
    State(state): State<AppState>,
    Path((server, backup)): Path<(String, String)>,
    Query(query): Query<RepoParams>,
    body: Option<Json<KeyBody>>,
) -> ApiResult<Response> {
    let detach = query.detach();
    let target = body_target(server, &query, body);

    match state.orchestrator.restore_backup(&target, &backup, detach).await? {
        Dispatch::Started(record) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "message": "restore started", "status": record })),
        )
            .into_response()),
        Dispatch::Finished(outcome) => Ok(Json(json!({
            "message": "restore completed",
            "snapshot_id": outcome.snapshot_id,
        }))
        .into_response()),
    }
}

async fn restore_status_handler(
    State(state): State<AppState>,
    Path(server): Path<String>,
    Query(query): Query<RepoParams>,
) -> ApiResult<Response> {
    let target = repo_target(server, &query, None, None);
    Ok(Json(state.orchestrator.restore_status(&target).await?).into_response())
}

// --- Download handlers ---

async fn prepare_handler(
    State(state): State<AppState>,
    Path((server, backup)): Path<(String, String)>,
    Query(query): Query<RepoParams>,
    body: Option<Json<KeyBody>>,
) -> ApiResult<Response> {
    let detach = query.detach();
    let target = body_target(server, &query, body);

    match state.orchestrator.prepare_download(&target, &backup, detach).await? {
        Dispatch::Started(record) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "message": "preparing", "status": record })),
        )
            .into_response()),
        Dispatch::Finished(prepared) => Ok(Json(json!({
            "message": "prepared",
            "file_name": prepared.file_name(),
            "size_bytes": prepared.size,
            "reused": prepared.reused,
        }))
        .into_response()),
    }
}

async fn prepare_status_handler(
    State(state): State<AppState>,
    Path((server, backup)): Path<(String, String)>,
    Query(query): Query<RepoParams>,
) -> ApiResult<Response> {
    let target = repo_target(server, &query, None, None);
    Ok(Json(state.orchestrator.prepare_status(&target, &backup).await?).into_response())
}

async fn download_handler(
    State(state): State<AppState>,
    Path((server, backup)): Path<(String, String)>,
    Query(query): Query<RepoParams>,
) -> ApiResult<Response> {
    let target = repo_target(server, &query, None, None);
    let download = state.orchestrator.download(&target, &backup).await?;
    attachment(
        "application/zstd",
        &download.file_name,
        Some(download.len),
        Body::from_stream(download.stream),
    )
}

// --- Archive handlers ---

async fn list_archives_handler(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let archives = state.orchestrator.list_archives().await?;
    Ok(Json(json!({ "archives": archives })))
}

async fn delete_archive_handler(
    State(state): State<AppState>,
    Path(archive): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.orchestrator.delete_archive(&archive).await?;
    Ok(Json(json!({ "message": "archive deleted", "id": archive })))
}

async fn download_archive_handler(
    State(state): State<AppState>,
    Path(archive): Path<String>,
) -> ApiResult<Response> {
    let download = state.orchestrator.download_archive(&archive).await?;
    attachment(
        "application/gzip",
        &download.file_name,
        None,
        Body::from_stream(download.stream),
    )
}

fn attachment(content_type: &'static str, file_name: &str, len: Option<u64>, body: Body) -> ApiResult<Response> {
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name))
        .map_err(|e| BackupError::Internal(format!("invalid file name header: {}", e)))?;

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    if let Some(len) = len {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    Ok(response)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
mod tests;
