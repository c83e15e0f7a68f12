use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};

use crate::error::{ApiResponse, Result};
use crate::models::{CurrentOwner, FileResponse, TrashListing};
use crate::services::{EmptyTrashReport, TrashService};
use crate::AppState;

/// GET /api/v1/trash
pub async fn list_trash(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
) -> Result<Json<ApiResponse<TrashListing>>> {
    let listing = TrashService::list_trash(&state.db, &current_owner.id).await?;
    Ok(Json(ApiResponse::success(listing)))
}

/// Move a file to trash
/// PATCH /api/v1/files/:id/trash
pub async fn trash_file(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    TrashService::trash_file(&state, &id, &current_owner.id).await?;
    Ok(Json(ApiResponse::<()>::success_message("File moved to trash")))
}

/// Restore a file from trash
/// PATCH /api/v1/files/:id/restore
pub async fn restore_file(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<FileResponse>>> {
    let file = TrashService::restore_file(&state, &id, &current_owner.id).await?;
    Ok(Json(ApiResponse::success(file)))
}

/// Permanently delete a file and its history
/// DELETE /api/v1/files/:id
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    TrashService::permanently_delete(&state, &id, &current_owner.id).await?;
    Ok(Json(ApiResponse::<()>::success_message("File deleted")))
}

/// DELETE /api/v1/trash
pub async fn empty_trash(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
) -> Result<Json<ApiResponse<EmptyTrashReport>>> {
    let report = TrashService::empty_trash(&state, &current_owner.id).await?;
    Ok(Json(ApiResponse::success(report)))
}
