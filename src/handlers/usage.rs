use axum::{
    extract::{Path, State},
    Extension, Json,
};

use crate::error::{ApiResponse, AppError, Result};
use crate::models::{CurrentOwner, SetQuotaRequest, StorageStats, Usage};
use crate::AppState;

/// Get storage usage
/// GET /api/v1/usage
pub async fn get_usage(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
) -> Result<Json<ApiResponse<Usage>>> {
    let usage = state.quota.current_usage(&state.db, &current_owner.id).await?;
    Ok(Json(ApiResponse::success(usage)))
}

/// GET /api/v1/stats
pub async fn get_stats(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
) -> Result<Json<ApiResponse<StorageStats>>> {
    let stats = state.quota.storage_stats(&state.db, &current_owner.id).await?;
    Ok(Json(ApiResponse::success(stats)))
}

/// Check if owner is admin
fn require_admin(owner: &CurrentOwner) -> Result<()> {
    if !owner.is_admin {
        return Err(AppError::Forbidden("Admin access required".to_string()));
    }
    Ok(())
}

/// Set an owner's ceiling
/// PUT /api/v1/quota/:owner
pub async fn set_quota(
    State(state): State<AppState>,
    Extension(current_owner): Extension<CurrentOwner>,
    Path(owner): Path<String>,
    Json(req): Json<SetQuotaRequest>,
) -> Result<Json<ApiResponse<Usage>>> {
    require_admin(&current_owner)?;

    tracing::info!("{} sets quota of {} to {}", current_owner.id, owner, req.ceiling);
    let usage = state.quota.set_quota(&state.db, &owner, req.ceiling).await?;
    Ok(Json(ApiResponse::success(usage)))
}
