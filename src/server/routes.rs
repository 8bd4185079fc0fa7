use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use url::Url;

use crate::crawler::extractor::filename_from_url;
use crate::models::{
    BulkUploadParams, BulkUploadResponse, CreateCrawlJobRequest, Job, JobKind, NewJob,
};
use crate::partslist::parse_parts_list;
use crate::store::StoreError;
use crate::AppState;

/// API error envelope: `{"detail": "<human readable>"}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    fn conflict(detail: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::CONFLICT,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "State store error");
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: "internal storage error".to_string(),
        }
    }
}

/// GET /api/stats
pub async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.stats().await?))
}

/// GET /api/active-jobs
pub async fn active_jobs(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.active_jobs().await?))
}

// --- Crawl jobs ---

/// GET /api/crawl-jobs
pub async fn list_crawl_jobs(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_jobs(Some(JobKind::Crawl)).await?))
}

/// POST /api/crawl-jobs
pub async fn create_crawl_job(
    State(state): State<AppState>,
    Json(payload): Json<CreateCrawlJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.manufacturer_name.trim().is_empty() {
        return Err(ApiError::bad_request("manufacturer_name must not be empty"));
    }
    if payload.sharepoint_folder.trim().is_empty() {
        return Err(ApiError::bad_request("sharepoint_folder must not be empty"));
    }
    let seed = Url::parse(&payload.domain)
        .map_err(|_| ApiError::bad_request("domain must be a valid URL"))?;
    if seed.scheme() != "http" && seed.scheme() != "https" {
        return Err(ApiError::bad_request("domain must be an http(s) URL"));
    }

    let job = state
        .store
        .create_job(NewJob {
            kind: JobKind::Crawl,
            manufacturer_name: payload.manufacturer_name.trim().to_string(),
            source: seed.to_string(),
            product_lines: payload.product_lines,
            sharepoint_folder: payload.sharepoint_folder.trim().to_string(),
            weekly_recrawl: payload.weekly_recrawl,
        })
        .await?;
    state.supervisor.submit(&job.id).await;

    tracing::info!(job_id = %job.id, domain = %job.source, "Crawl job accepted");
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /api/crawl-jobs/{id}
pub async fn get_crawl_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(load_job(&state, &job_id, JobKind::Crawl).await?))
}

/// POST /api/crawl-jobs/{id}/cancel
pub async fn cancel_crawl_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    cancel_job(&state, &job_id, JobKind::Crawl).await
}

/// GET /api/crawl-jobs/{id}/pdfs
pub async fn crawl_job_pdfs(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = load_job(&state, &job_id, JobKind::Crawl).await?;
    Ok(Json(state.store.pdfs_for_job(&job.id).await?))
}

// --- Bulk-upload jobs ---

/// POST /api/bulk-upload?manufacturer_name=&sharepoint_folder=
///
/// Multipart upload of a parts-list file. Rows are validated up-front; the
/// response carries how many were accepted and rejected.
pub async fn create_bulk_upload(
    State(state): State<AppState>,
    Query(params): Query<BulkUploadParams>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    if params.manufacturer_name.trim().is_empty() {
        return Err(ApiError::bad_request("manufacturer_name must not be empty"));
    }
    if params.sharepoint_folder.trim().is_empty() {
        return Err(ApiError::bad_request("sharepoint_folder must not be empty"));
    }

    let mut file_bytes = None;
    let mut file_name = "parts-list.csv".to_string();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
    {
        if let Some(name) = field.file_name() {
            file_name = name.to_string();
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("failed to read upload: {e}")))?;
        file_bytes = Some(bytes);
        break;
    }
    let Some(bytes) = file_bytes else {
        return Err(ApiError::bad_request("missing parts-list file"));
    };

    let parsed = parse_parts_list(&bytes)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    if parsed.rows.is_empty() {
        return Err(ApiError::bad_request(format!(
            "no valid rows in parts list ({} rejected)",
            parsed.rejected
        )));
    }

    let job = state
        .store
        .create_job(NewJob {
            kind: JobKind::BulkUpload,
            manufacturer_name: params.manufacturer_name.trim().to_string(),
            source: file_name,
            product_lines: vec![],
            sharepoint_folder: params.sharepoint_folder.trim().to_string(),
            weekly_recrawl: false,
        })
        .await?;

    let mut accepted = 0;
    for row in &parsed.rows {
        if state
            .store
            .insert_pdf(
                &job.id,
                &row.pdf_url,
                &filename_from_url(&row.pdf_url),
                Some(&row.part_number),
            )
            .await?
        {
            state.store.incr_found(&job.id, 1).await?;
            accepted += 1;
        }
    }

    state.supervisor.submit(&job.id).await;
    tracing::info!(job_id = %job.id, rows = accepted, rejected = parsed.rejected, "Bulk upload accepted");

    let job = state
        .store
        .get_job(&job.id)
        .await?
        .ok_or_else(|| ApiError::not_found("job vanished during creation"))?;
    Ok((
        StatusCode::CREATED,
        Json(BulkUploadResponse {
            job,
            rows_accepted: accepted,
            rows_rejected: parsed.rejected,
        }),
    ))
}

/// GET /api/bulk-upload-jobs
pub async fn list_bulk_upload_jobs(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_jobs(Some(JobKind::BulkUpload)).await?))
}

/// GET /api/bulk-upload-jobs/{id}
pub async fn get_bulk_upload_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(load_job(&state, &job_id, JobKind::BulkUpload).await?))
}

/// POST /api/bulk-upload-jobs/{id}/cancel
pub async fn cancel_bulk_upload_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    cancel_job(&state, &job_id, JobKind::BulkUpload).await
}

/// GET /api/bulk-upload-jobs/{id}/pdfs
pub async fn bulk_upload_job_pdfs(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = load_job(&state, &job_id, JobKind::BulkUpload).await?;
    Ok(Json(state.store.pdfs_for_job(&job.id).await?))
}

// --- Schedules ---

/// GET /api/schedules
pub async fn list_schedules(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_schedules().await?))
}

/// GET /api/schedules/{id}
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = state
        .store
        .get_schedule(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("schedule {id} not found")))?;
    Ok(Json(schedule))
}

/// DELETE /api/schedules/{id}
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.store.delete_schedule(&id).await? {
        return Err(ApiError::not_found(format!("schedule {id} not found")));
    }
    Ok(Json(json!({ "detail": "schedule deleted" })))
}

// --- Helpers ---

async fn load_job(state: &AppState, job_id: &str, kind: JobKind) -> Result<Job, ApiError> {
    let job = state
        .store
        .get_job(job_id)
        .await?
        .filter(|j| j.kind == kind)
        .ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))?;
    Ok(job)
}

async fn cancel_job(
    state: &AppState,
    job_id: &str,
    kind: JobKind,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let job = load_job(state, job_id, kind).await?;
    if job.status.is_terminal() {
        return Err(ApiError::conflict(format!(
            "job is already {}",
            job.status.as_str()
        )));
    }
    state.store.request_cancel(&job.id).await?;
    tracing::info!(job_id = %job.id, "Cancellation requested");
    Ok((
        StatusCode::OK,
        Json(json!({ "id": job.id, "detail": "cancellation requested" })),
    ))
}
