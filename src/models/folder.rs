use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Folder model
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Folder {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub trashed: bool,
    pub trashed_at: Option<String>,
    pub created_at: String,
}

/// Create folder request
#[derive(Debug, Deserialize)]
pub struct CreateFolderRequest {
    pub name: String,
    pub parent_id: Option<String>,
}
