use axum::{
    body::Body,
    extract::{multipart::Field, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    Extension, Json,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{ApiResponse, AppError, Result};
use crate::models::{
    CurrentOwner, FileListItem, FileResponse, ListFilesQuery, UpdateTagsRequest, UploadOutcome,
    UploadReceipt, UploadRequest, VersionListResponse, VersionRestoreResponse,
};
use crate::services::{FileService, VersionService};
use crate::AppState;

/// Multipart file part spooled to local disk before admission
struct SpooledPart {
    name: String,
    content_type: Option<String>,
    path: PathBuf,
}

impl SpooledPart {
    async fn remove(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::error!("Failed to remove temp file {:?}: {}", self.path, e);
        }
    }
}

/// Stream one multipart field to a temp file in the staging area
async fn spool_field(state: &AppState, field: Field<'_>) -> Result<SpooledPart> {
    let name = field
        .file_name()
        .map(|s| s.to_string())
        .ok_or_else(|| AppError::Validation("No file name provided".to_string()))?;
    let content_type = field.content_type().map(|s| s.to_string());

    let staging_dir = state.hasher.staging_dir();
    tokio::fs::create_dir_all(staging_dir).await?;
    let path = staging_dir.join(format!("upload-{}", Uuid::new_v4()));

    let max_size = state.config.upload.max_file_size_bytes();
    spool_chunks(field, &path, max_size).await?;

    Ok(SpooledPart {
        name,
        content_type,
        path,
    })
}

/// Write a chunk stream to `path`, bounded by `max_size`.
/// The file is removed again when anything fails.
async fn spool_chunks<S, E>(chunks: S, path: &std::path::Path, max_size: u64) -> Result<u64>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let result = write_chunks(chunks, path, max_size).await;
    if result.is_err() {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!("Failed to remove temp file {:?}: {}", path, e),
        }
    }
    result
}

async fn write_chunks<S, E>(chunks: S, path: &std::path::Path, max_size: u64) -> Result<u64>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
{
    futures::pin_mut!(chunks);
    let mut written: u64 = 0;
    let mut file = tokio::fs::File::create(path).await?;

    while let Some(chunk) = chunks.next().await {
        let chunk =
            chunk.map_err(|e| AppError::Validation(format!("Failed to read file chunk: {}", e)))?;
        written += chunk.len() as u64;
        if written > max_size {
            return Err(AppError::Validation(format!(
                "File exceeds maximum upload size of {} bytes",
                max_size
            )));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(written)
}

fn parse_tags(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Shared form fields plus spooled file parts
struct UploadForm {
    parts: Vec<SpooledPart>,
    folder_id: Option<String>,
    tags: Vec<String>,
}

impl UploadForm {
    async fn cleanup(&self) {
        for part in &self.parts {
            part.remove().await;
        }
    }

    fn request_for(&self, part: &SpooledPart) -> UploadRequest {
        UploadRequest {
            name: part.name.clone(),
            folder_id: self.folder_id.clone(),
            tags: self.tags.clone(),
            declared_mime: part.content_type.clone(),
        }
    }
}

async fn read_form(state: &AppState, mut multipart: Multipart, file_field: &str) -> Result<UploadForm> {
    let mut form = UploadForm {
        parts: Vec::new(),
        folder_id: None,
        tags: Vec::new(),
    };

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                form.cleanup().await;
                return Err(AppError::Validation(format!("Failed to process multipart: {}", e)));
            }
        };
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            n if n == file_field => match spool_field(state, field).await {
                Ok(part) => form.parts.push(part),
                Err(e) => {
                    form.cleanup().await;
                    return Err(e);
                }
            },
            "folder_id" => {
                let text = field.text().await.unwrap_or_default();
                if !text.is_empty() {
                    form.folder_id = Some(text);
                }
            }
            "tags" => {
                let text = field.text().await.unwrap_or_default();
                form.tags = parse_tags(&text);
            }
            _ => {}
        }
    }

    Ok(form)
}

/// Upload a file
/// POST /api/v1/files/upload
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<UploadReceipt>>> {
    let form = read_form(&state, multipart, "file").await?;
    let Some(part) = form.parts.first() else {
        return Err(AppError::Validation("No file provided".to_string()));
    };

    let result = match tokio::fs::File::open(&part.path).await {
        Ok(content) => {
            FileService::admit_upload(&state, &current_owner.id, form.request_for(part), content).await
        }
        Err(e) => Err(e.into()),
    };

    form.cleanup().await;
    Ok(Json(ApiResponse::success(result?)))
}

/// Upload several files; each one is admitted or rejected on its own
/// POST /api/v1/files/batch
pub async fn upload_batch(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<Vec<UploadOutcome>>>> {
    let form = read_form(&state, multipart, "files").await?;
    if form.parts.is_empty() {
        return Err(AppError::Validation("No files provided".to_string()));
    }

    let mut items = Vec::with_capacity(form.parts.len());
    for part in &form.parts {
        match tokio::fs::File::open(&part.path).await {
            Ok(content) => items.push((form.request_for(part), content)),
            Err(e) => {
                form.cleanup().await;
                return Err(e.into());
            }
        }
    }

    let outcomes = FileService::admit_batch(&state, &current_owner.id, items).await;

    form.cleanup().await;
    Ok(Json(ApiResponse::success(outcomes)))
}

/// List live files, optionally within one folder
/// GET /api/v1/files?folder_id=
pub async fn list_files(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<ApiResponse<Vec<FileListItem>>>> {
    let files =
        FileService::list_files(&state.db, &current_owner.id, query.folder_id.as_deref()).await?;
    Ok(Json(ApiResponse::success(files)))
}

/// Download a file
/// GET /api/v1/files/:id/download
pub async fn download_file(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Path(id): Path<String>,
) -> Result<Response> {
    let (file, data) = FileService::download(&state, &id, &current_owner.id).await?;

    let fallback_name = file.name.replace(['"', '\\'], "_");
    let encoded_name = urlencoding::encode(&file.name);

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &file.mime_type)
        .header(header::CONTENT_LENGTH, data.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                fallback_name, encoded_name
            ),
        )
        .body(Body::from(data))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))?;

    Ok(response)
}

/// Replace a file's tags
/// PATCH /api/v1/files/:id/tags
pub async fn update_tags(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTagsRequest>,
) -> Result<Json<ApiResponse<FileResponse>>> {
    let file = FileService::update_tags(&state, &id, &current_owner.id, &req.tags).await?;
    Ok(Json(ApiResponse::success(file)))
}

/// GET /api/v1/files/:id/versions
pub async fn list_versions(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<VersionListResponse>>> {
    let versions = VersionService::list_versions(&state, &id, &current_owner.id).await?;
    Ok(Json(ApiResponse::success(versions)))
}

/// POST /api/v1/files/:id/versions/:version/restore
pub async fn restore_version(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Path((id, version)): Path<(String, i64)>,
) -> Result<Json<ApiResponse<VersionRestoreResponse>>> {
    let restored = VersionService::restore_version(&state, &id, &current_owner.id, version).await?;
    Ok(Json(ApiResponse::success(restored)))
}
