use axum::{
    body::Body,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::QueryRejection,
        Multipart, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures::StreamExt;
use uuid::Uuid;

use crate::error::{ApiResponse, AppError, Result};
use crate::models::{ClaimSet, FileQuery, FileRecord};
use crate::services::{Download, StagedUpload};
use crate::AppState;

const FILE_FIELD: &str = "uploadingForm";
const DESCRIPTION_FIELD: &str = "fileDescription";

/// Ids are UUIDs; anything else cannot name a file
fn parse_file_id(id: &str) -> Result<String> {
    Uuid::parse_str(id)
        .map(|id| id.to_string())
        .map_err(|_| AppError::not_found())
}

fn multipart_error(state: &AppState, e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::BadRequest(format!(
            "File is too big! (Max size: {} bytes)",
            state.files.max_upload_size()
        ))
    } else {
        AppError::BadRequest(format!("Failed to process multipart: {}", e.body_text()))
    }
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false)
}

/// Upload a file
/// POST /upload (multipart: uploadingForm, fileDescription)
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(claims): Extension<ClaimSet>,
    headers: HeaderMap,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<FileRecord>> {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    state.files.check_upload_size(content_length)?;

    let mut multipart = multipart.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let mut staged: Option<StagedUpload> = None;
    let mut description = String::new();

    if let Err(e) = read_upload_form(&state, &claims, &mut multipart, &mut staged, &mut description).await {
        if let Some(staged) = staged {
            state.files.abort_upload(staged).await;
        }
        return Err(e);
    }

    let staged = staged.ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;
    let record = state.files.commit_upload(staged, &description).await?;
    Ok(Json(record))
}

/// Walk the multipart form, streaming the first file field into storage
async fn read_upload_form(
    state: &AppState,
    claims: &ClaimSet,
    multipart: &mut Multipart,
    staged: &mut Option<StagedUpload>,
    description: &mut String,
) -> Result<()> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(state, e))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            FILE_FIELD if staged.is_none() => {
                let file_name = field.file_name().unwrap_or("").to_string();
                let data = field.map(|chunk| chunk.map_err(|e| multipart_error(state, e)));
                *staged = Some(state.files.stage_upload(claims, file_name, data).await?);
            }
            DESCRIPTION_FIELD => {
                *description = field.text().await.map_err(|e| multipart_error(state, e))?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Stream a file, or its metadata when the client asks for JSON
/// GET /files/:id
pub async fn get_file(
    State(state): State<AppState>,
    Extension(claims): Extension<ClaimSet>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let id = parse_file_id(&id)?;

    if wants_json(&headers) {
        let record = state.files.get_file(&claims, &id).await?;
        return Ok(Json(record).into_response());
    }

    let download = state.files.download(&claims, &id).await?;
    stream_response(download)
}

/// File metadata
/// GET /files/:id/info
pub async fn get_file_info(
    State(state): State<AppState>,
    Extension(claims): Extension<ClaimSet>,
    Path(id): Path<String>,
) -> Result<Json<FileRecord>> {
    let id = parse_file_id(&id)?;
    let record = state.files.get_file(&claims, &id).await?;
    Ok(Json(record))
}

/// Download a file
/// GET /download/:id
pub async fn download_file(
    State(state): State<AppState>,
    Extension(claims): Extension<ClaimSet>,
    Path(id): Path<String>,
) -> Result<Response> {
    let id = parse_file_id(&id)?;
    let download = state.files.download(&claims, &id).await?;
    stream_response(download)
}

fn stream_response(download: Download) -> Result<Response> {
    let Download { record, body } = download;

    let fallback_name = record.file_name.replace(['"', '\\', '\r', '\n'], "_");
    let encoded_name = urlencoding::encode(&record.file_name);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, record.length)
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                fallback_name, encoded_name
            ),
        )
        .body(Body::from_stream(body))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}

/// List files
/// GET /files?sorted_by=name|date&user=<id>
pub async fn list_files(
    State(state): State<AppState>,
    Extension(claims): Extension<ClaimSet>,
    query: std::result::Result<Query<FileQuery>, QueryRejection>,
) -> Result<Json<Vec<FileRecord>>> {
    let Query(query) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let files = state
        .files
        .list_files(&claims, query.user.as_deref(), query.sorted_by)
        .await?;
    Ok(Json(files))
}

/// Delete a file
/// DELETE /files/:id
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(claims): Extension<ClaimSet>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = parse_file_id(&id)?;
    state.files.delete_file(&claims, &id).await?;
    Ok(Json(ApiResponse::<()>::success_message(
        "Successfully deleted file!",
    )))
}

/// Liveness probe
/// GET /health
pub async fn health() -> &'static str {
    "ok"
}
