use crate::attachment_host::AttachmentHost;
use crate::config::ApiConfig;
use crate::deletion::{BulkDeletionReport, DeletionCoordinator, DeletionError, DeletionReport};
use crate::issuer::{UploadIssuer, UploadLink};
use crate::part_registry::{FileExport, FileSort, PartRegistry};
use crate::part_uploader::{PartUploader, UploadError, UploaderSettings};
use crate::rendezvous::{BrokerError, RendezvousBroker, UploadFailure, UploadReport};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

const OWNER_HEADER: &str = "x-owner-id";
const TRIGGER_KEY_HEADER: &str = "x-trigger-key";
const FILENAME_HEADER: &str = "x-filename";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PartRegistry>,
    pub broker: Arc<RendezvousBroker>,
    pub host: Arc<dyn AttachmentHost>,
    pub deletion: Arc<DeletionCoordinator>,
    pub issuer: UploadIssuer,
    pub uploader: UploaderSettings,
    /// Expected `X-Trigger-Key`, trigger API is open if unset
    pub trigger_key: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: code.to_string(),
        }),
    )
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> ApiError {
    error!(error = %e, "{}", context);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", context)
}

/// Upload page pre-check response
#[derive(Debug, Serialize)]
pub struct TokenStatusResponse {
    pub file_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Everything a client needs to reassemble a file
#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub filename: String,
    pub content_type: String,
    pub category: &'static str,
    pub urls: Vec<String>,
}

/// Upload link request from a trigger
#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub file_id: String,
    pub owner_id: String,
}

/// Query parameters for owner file listings
#[derive(Debug, Deserialize)]
pub struct FileListQuery {
    #[serde(default)]
    pub sort: FileSort,
    /// Only files whose name starts with this
    pub prefix: Option<String>,
}

/// File in an owner listing
#[derive(Debug, Serialize)]
pub struct FileSummary {
    pub id: String,
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    /// Download page path, once the upload has started
    pub download_path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<FileSummary>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let trigger_api = Router::new()
        .route("/api/v1/uploads", post(request_upload))
        .route("/api/v1/uploads/:file_id", delete(retract_upload))
        .route("/api/v1/files/:file_id", delete(delete_file))
        .route(
            "/api/v1/owners/:owner_id/files",
            get(list_owner_files).delete(delete_owner_files),
        )
        .route("/api/v1/owners/:owner_id/export", get(export_owner_files))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_trigger_key));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/file", put(upload_file).layer(DefaultBodyLimit::disable()))
        .route("/upload/:token", get(token_status))
        .route("/file/:file_id/:filename", get(resolve_download))
        .merge(trigger_api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "splitter-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.registry.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected",
                "pending_uploads": state.broker.pending_count()
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": format!("{:#}", e)
            })),
        ),
    }
}

async fn require_trigger_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected) = state.trigger_key {
        let provided = request
            .headers()
            .get(TRIGGER_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return api_error(StatusCode::UNAUTHORIZED, "INVALID_TRIGGER_KEY", "Invalid trigger key")
                .into_response();
        }
    }
    next.run(request).await
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Receive a file and upload it in parts
#[instrument(skip(state, headers, body))]
async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, String), ApiError> {
    let invalid_token = || api_error(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", "Invalid upload token");

    let token = header_str(&headers, header::AUTHORIZATION).ok_or_else(invalid_token)?;
    let entry = state
        .registry
        .file_by_token(token)
        .await
        .map_err(|e| internal_error("Failed to look up upload token", e))?
        .ok_or_else(invalid_token)?;
    if !entry.is_open(Utc::now().timestamp_millis()) {
        return Err(invalid_token());
    }
    let file_id = entry.id;

    let filename = header_str(&headers, FILENAME_HEADER)
        .filter(|name| !name.is_empty())
        .map(|name| name.replace(' ', "_"))
        .ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "MISSING_FILENAME",
                "No filename provided - \"X-Filename\" header is missing",
            )
        })?;
    let content_type = header_str(&headers, header::CONTENT_TYPE)
        .unwrap_or("application/octet-stream")
        .to_string();

    let declared_size = match header_str(&headers, header::CONTENT_LENGTH) {
        None => {
            return Err(api_error(
                StatusCode::LENGTH_REQUIRED,
                "LENGTH_REQUIRED",
                "Content-Length header is required",
            ))
        }
        Some(value) => value.parse::<u64>().map_err(|_| {
            api_error(StatusCode::BAD_REQUEST, "INVALID_LENGTH", "Invalid Content-Length header")
        })?,
    };
    if declared_size > state.uploader.max_file_size {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "FILE_TOO_LARGE",
            format!("File exceeds the limit of {} bytes", state.uploader.max_file_size),
        ));
    }

    let first_upload = state
        .registry
        .set_metadata(&file_id, &filename, &content_type)
        .await
        .map_err(|e| internal_error("Failed to record file metadata", e))?;
    if !first_upload {
        return Err(api_error(
            StatusCode::CONFLICT,
            "UPLOAD_IN_PROGRESS",
            "An upload with this token has already started",
        ));
    }
    state.broker.begin(&file_id);

    // The row is claimed, so only this request may close it
    if declared_size == 0 {
        close_upload(&state, &file_id).await;
        report_upload_result(&state, &file_id, Err(UploadFailure::Empty)).await?;
        return Err(empty_file());
    }

    info!(file_id = %file_id, declared_size = declared_size, "Receiving file");

    let uploader = PartUploader::new(
        state.host.clone(),
        state.registry.clone(),
        state.uploader.clone(),
        file_id.as_str(),
        filename.as_str(),
    );
    let result = uploader.upload_stream(body.into_data_stream()).await;
    close_upload(&state, &file_id).await;

    let outcome = match result {
        Ok(summary) if summary.total_bytes == 0 => Err(UploadFailure::Empty),
        Ok(summary) => Ok(UploadReport {
            file_id: file_id.clone(),
            filename: filename.clone(),
            file_size: summary.total_bytes,
        }),
        Err(ref e) => {
            warn!(file_id = %file_id, error = %e, "Upload aborted");
            Err(failure_of(e))
        }
    };

    report_upload_result(&state, &file_id, outcome.clone()).await?;

    match outcome {
        Ok(_) => Ok((StatusCode::CREATED, format!("/file/{}/{}", file_id, filename))),
        Err(UploadFailure::Empty) => Err(empty_file()),
        Err(UploadFailure::TooLarge { limit }) => Err(api_error(
            StatusCode::BAD_REQUEST,
            "FILE_TOO_LARGE",
            format!("File exceeds the limit of {} bytes", limit),
        )),
        Err(UploadFailure::Body(message)) => {
            Err(api_error(StatusCode::BAD_REQUEST, "BODY_ERROR", message))
        }
        Err(UploadFailure::HostRejected(message)) => {
            Err(api_error(StatusCode::BAD_GATEWAY, "HOST_ERROR", message))
        }
        Err(failure) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "UPLOAD_FAILED",
            failure.to_string(),
        )),
    }
}

fn empty_file() -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "EMPTY_FILE", "File is empty")
}

fn failure_of(error: &UploadError) -> UploadFailure {
    match error {
        UploadError::Host(e) => UploadFailure::HostRejected(e.to_string()),
        UploadError::UrlCountMismatch { .. } => UploadFailure::HostRejected(error.to_string()),
        UploadError::TooLarge { limit } => UploadFailure::TooLarge { limit: *limit },
        UploadError::Body(message) => UploadFailure::Body(message.clone()),
        UploadError::Registry(_) | UploadError::Spool(_) => UploadFailure::Storage(error.to_string()),
    }
}

async fn close_upload(state: &AppState, file_id: &str) {
    if let Err(e) = state.registry.close_upload(file_id).await {
        error!(file_id = %file_id, error = %format!("{:#}", e), "Failed to close upload");
    }
}

/// Settle the pending upload. Without one, the file is an orphan and is removed.
async fn report_upload_result(
    state: &AppState,
    file_id: &str,
    outcome: Result<UploadReport, UploadFailure>,
) -> Result<(), ApiError> {
    match state.broker.settle(file_id, outcome) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(file_id = %file_id, error = %e, "No pending upload found");
            match state.deletion.delete_file(file_id).await {
                Ok(report) if report.encountered_error() => {
                    warn!(file_id = %file_id, failures = report.failures.len(), "Orphaned upload only partly removed");
                }
                Ok(_) => {}
                Err(e) => error!(file_id = %file_id, error = %e, "Failed to remove orphaned upload"),
            }
            Err(api_error(
                StatusCode::BAD_REQUEST,
                "NO_PENDING_UPLOAD",
                "No pending upload found",
            ))
        }
    }
}

/// Check an upload token before showing the upload page
async fn token_status(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<TokenStatusResponse>, ApiError> {
    let entry = state
        .registry
        .file_by_token(&token)
        .await
        .map_err(|e| internal_error("Failed to look up upload token", e))?
        .filter(|entry| entry.is_open(Utc::now().timestamp_millis()))
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", "Invalid upload token"))?;

    Ok(Json(TokenStatusResponse {
        file_id: entry.id,
        expires_at: millis_to_datetime(entry.upload_expiry),
    }))
}

/// Resolve the ordered part URLs of a file
#[instrument(skip(state))]
async fn resolve_download(
    State(state): State<AppState>,
    Path((file_id, filename)): Path<(String, String)>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let not_found = || api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "Not found");

    let urls = state
        .registry
        .part_urls(&file_id)
        .await
        .map_err(|e| internal_error("Failed to query parts", e))?;
    if urls.is_empty() {
        return Err(not_found());
    }

    let metadata = state
        .registry
        .metadata(&file_id)
        .await
        .map_err(|e| internal_error("Failed to query file metadata", e))?
        .ok_or_else(not_found)?;
    let name = metadata.name.filter(|name| *name == filename).ok_or_else(not_found)?;
    let content_type = metadata
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());

    Ok(Json(DownloadResponse {
        filename: name,
        category: content_category(&content_type),
        content_type,
        urls,
    }))
}

/// Coarse category of a MIME type, used to pick a player
pub fn content_category(content_type: &str) -> &'static str {
    match content_type.split('/').next().unwrap_or_default() {
        "video" => "video",
        "image" => "image",
        "audio" => "audio",
        "text" => "text",
        _ => "other",
    }
}

/// Issue an upload link
#[instrument(skip(state))]
async fn request_upload(
    State(state): State<AppState>,
    Json(request): Json<UploadRequest>,
) -> Result<(StatusCode, Json<UploadLink>), ApiError> {
    match state.issuer.request_upload(&request.file_id, &request.owner_id).await {
        Ok(Some(link)) => Ok((StatusCode::CREATED, Json(link))),
        Ok(None) => Err(api_error(
            StatusCode::CONFLICT,
            "DUPLICATE_REQUEST",
            "An upload for this file is already pending",
        )),
        Err(BrokerError::FileExists(_)) => Err(api_error(
            StatusCode::CONFLICT,
            "FILE_EXISTS",
            "A file with this ID already exists",
        )),
        Err(e) => Err(internal_error("Failed to issue upload token", e)),
    }
}

/// Withdraw an unused upload link
async fn retract_upload(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.issuer.retract(&file_id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(BrokerError::NoPendingUpload(_)) => Err(api_error(
            StatusCode::NOT_FOUND,
            "NO_PENDING_UPLOAD",
            "No pending upload found",
        )),
        Err(e) => Err(internal_error("Failed to retract upload", e)),
    }
}

/// Delete one file on behalf of its owner
async fn delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeletionReport>, ApiError> {
    let owner_id = header_str(&headers, OWNER_HEADER).ok_or_else(|| {
        api_error(StatusCode::BAD_REQUEST, "MISSING_OWNER", "X-Owner-Id header is missing")
    })?;

    state
        .deletion
        .delete_owned(&file_id, owner_id)
        .await
        .map(Json)
        .map_err(deletion_error)
}

fn deletion_error(e: DeletionError) -> ApiError {
    match e {
        DeletionError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "File not found"),
        DeletionError::NotOwner { .. } => api_error(
            StatusCode::FORBIDDEN,
            "NOT_OWNER",
            "You can only delete your own files",
        ),
        DeletionError::Registry(e) => internal_error("Failed to delete file", format!("{:#}", e)),
    }
}

/// List an owner's files
async fn list_owner_files(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    Query(params): Query<FileListQuery>,
) -> Result<Json<FileListResponse>, ApiError> {
    let mut files = state
        .registry
        .files_by_owner(&owner_id, params.sort)
        .await
        .map_err(|e| internal_error("Failed to query files", format!("{:#}", e)))?;

    if let Some(prefix) = params.prefix {
        let matching: HashSet<String> = state
            .registry
            .filenames_by_owner(&owner_id, &prefix)
            .await
            .map_err(|e| internal_error("Failed to search filenames", format!("{:#}", e)))?
            .into_iter()
            .map(|m| m.id)
            .collect();
        files.retain(|file| matching.contains(&file.id));
    }

    let files = files
        .into_iter()
        .map(|file| FileSummary {
            download_path: file
                .name
                .as_ref()
                .map(|name| format!("/file/{}/{}", file.id, name)),
            uploaded_at: millis_to_datetime(file.created_at),
            id: file.id,
            name: file.name,
            content_type: file.content_type,
        })
        .collect();

    Ok(Json(FileListResponse { files }))
}

/// Delete every file of an owner
async fn delete_owner_files(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> Result<Json<BulkDeletionReport>, ApiError> {
    state
        .deletion
        .delete_all_owned(&owner_id)
        .await
        .map(Json)
        .map_err(deletion_error)
}

/// Export everything recorded about an owner's files
async fn export_owner_files(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> Result<Json<Vec<FileExport>>, ApiError> {
    state
        .registry
        .export_by_owner(&owner_id)
        .await
        .map(Json)
        .map_err(|e| internal_error("Failed to export files", format!("{:#}", e)))
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

/// Start the HTTP server, stopping when `shutdown` fires
pub async fn start_api_server(state: AppState, config: &ApiConfig, shutdown: CancellationToken) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting splitter API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
