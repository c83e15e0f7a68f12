use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::Folder;

/// File model
#[derive(Debug, Clone, FromRow)]
pub struct File {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub folder_id: Option<String>,
    pub blob_id: String,
    pub mime_type: String,
    /// JSON array of tag strings
    pub tags: String,
    pub trashed: bool,
    pub trashed_at: Option<String>,
    pub download_count: i64,
    pub preview_eligible: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl File {
    /// Decoded tags. A corrupt column is logged and read as no tags.
    pub fn tag_list(&self) -> Vec<String> {
        match serde_json::from_str(&self.tags) {
            Ok(tags) => tags,
            Err(e) => {
                tracing::warn!("File {} has undecodable tags {:?}: {}", self.id, self.tags, e);
                Vec::new()
            }
        }
    }
}

/// File response with decoded tags
#[derive(Debug, Clone, Serialize)]
pub struct FileResponse {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub folder_id: Option<String>,
    pub mime_type: String,
    pub tags: Vec<String>,
    pub trashed: bool,
    pub trashed_at: Option<String>,
    pub download_count: i64,
    pub preview_eligible: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<File> for FileResponse {
    fn from(file: File) -> Self {
        let tags = file.tag_list();
        Self {
            id: file.id,
            owner_id: file.owner_id,
            name: file.name,
            folder_id: file.folder_id,
            mime_type: file.mime_type,
            tags,
            trashed: file.trashed,
            trashed_at: file.trashed_at,
            download_count: file.download_count,
            preview_eligible: file.preview_eligible,
            created_at: file.created_at,
            updated_at: file.updated_at,
        }
    }
}

/// File row joined with its current blob
#[derive(Debug, Clone, FromRow)]
pub struct FileListRow {
    #[sqlx(flatten)]
    pub file: File,
    pub size: i64,
    pub digest: String,
}

/// Listing entry: file metadata plus the size and digest of its content
#[derive(Debug, Clone, Serialize)]
pub struct FileListItem {
    #[serde(flatten)]
    pub file: FileResponse,
    pub size: i64,
    pub blob_digest: String,
}

impl From<FileListRow> for FileListItem {
    fn from(row: FileListRow) -> Self {
        Self {
            file: FileResponse::from(row.file),
            size: row.size,
            blob_digest: row.digest,
        }
    }
}

/// List files query
#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub folder_id: Option<String>,
}

/// Trashed files and folders of one owner, most recently trashed first
#[derive(Debug, Clone, Serialize)]
pub struct TrashListing {
    pub files: Vec<FileListItem>,
    pub folders: Vec<Folder>,
}

/// Metadata accompanying one uploaded byte stream
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub name: String,
    pub folder_id: Option<String>,
    pub tags: Vec<String>,
    /// Content type claimed by the client
    pub declared_mime: Option<String>,
}

/// Receipt for an admitted upload
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UploadReceipt {
    pub file_id: String,
    pub blob_digest: String,
    pub size: i64,
    pub mime: String,
    /// History entry written for the content this upload replaced
    pub version: Option<i64>,
    /// The content was already stored and only gained a reference
    pub deduplicated: bool,
}

/// Per-item result of a batch upload
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UploadOutcome {
    Admitted(UploadReceipt),
    Rejected {
        name: String,
        reason: String,
        message: String,
    },
}

/// Update tags request
#[derive(Debug, Deserialize)]
pub struct UpdateTagsRequest {
    pub tags: Vec<String>,
}
