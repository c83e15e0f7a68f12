use serde::Serialize;
use sqlx::FromRow;

/// Blob model - one row per distinct content digest
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Blob {
    pub id: String,
    pub digest: String,
    pub size: i64,
    pub locator: String,
    pub ref_count: i64,
    pub created_at: String,
}

/// Reference to a blob handed out by the blob store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub id: String,
    pub digest: String,
    pub size: i64,
    pub locator: String,
    /// Reference count after the operation that produced this handle
    pub ref_count: i64,
    /// True when this call inserted the catalog row
    pub created: bool,
}

/// Blob whose last reference was released inside a committed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedBlob {
    pub digest: String,
    pub locator: String,
    pub size: i64,
}
