use serde::Serialize;
use sqlx::FromRow;

/// Version joined with the blob it points at
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct VersionEntry {
    pub version_number: i64,
    pub digest: String,
    pub size: i64,
    pub mime_type: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct VersionListResponse {
    pub file_id: String,
    pub versions: Vec<VersionEntry>,
}

#[derive(Debug, Serialize)]
pub struct VersionRestoreResponse {
    pub file_id: String,
    pub restored_version: i64,
    /// Version number under which the replaced content was kept
    pub snapshot_version: i64,
}
