use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};

use crate::error::{ApiResponse, Result};
use crate::models::{CreateFolderRequest, CurrentOwner, Folder};
use crate::services::FolderService;
use crate::AppState;

/// Create a folder
/// POST /api/v1/folders
pub async fn create_folder(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Json(req): Json<CreateFolderRequest>,
) -> Result<Json<ApiResponse<Folder>>> {
    let folder =
        FolderService::create_folder(&state, &current_owner.id, &req.name, req.parent_id.as_deref())
            .await?;
    Ok(Json(ApiResponse::success(folder)))
}

/// PATCH /api/v1/folders/:id/trash
pub async fn trash_folder(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    FolderService::trash_folder(&state, &id, &current_owner.id).await?;
    Ok(Json(ApiResponse::<()>::success_message("Folder moved to trash")))
}

/// PATCH /api/v1/folders/:id/restore
pub async fn restore_folder(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Folder>>> {
    let folder = FolderService::restore_folder(&state, &id, &current_owner.id).await?;
    Ok(Json(ApiResponse::success(folder)))
}

/// Permanently delete a folder with everything below it
/// DELETE /api/v1/folders/:id
pub async fn delete_folder(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    FolderService::permanently_delete_folder(&state, &id, &current_owner.id).await?;
    Ok(Json(ApiResponse::<()>::success_message("Folder deleted")))
}
