use std::path::PathBuf;
use tempfile::TempDir;

use crate::config::Config;
use crate::error::Result;
use crate::models::{UploadReceipt, UploadRequest};
use crate::services::FileService;
use crate::AppState;

/// Fresh catalog and content root inside a temporary directory
pub struct TestHarness {
    pub state: AppState,
    dir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.database.path = dir.path().join("catalog.db").to_string_lossy().into_owned();
        config.database.max_connections = 8;
        config.storage.content_root = dir.path().join("blobs").to_string_lossy().into_owned();
        config.upload.max_conflict_retries = 20;

        let state = AppState::new(config).await.unwrap();
        Self { state, dir }
    }

    pub async fn upload(&self, owner_id: &str, name: &str, content: &[u8]) -> Result<UploadReceipt> {
        let request = UploadRequest {
            name: name.to_string(),
            ..Default::default()
        };
        FileService::admit_upload(&self.state, owner_id, request, content).await
    }

    pub async fn count(&self, sql: &str) -> i64 {
        sqlx::query_scalar(sql)
            .fetch_one(self.state.db.pool())
            .await
            .unwrap()
    }

    pub async fn ref_count(&self, digest: &str) -> Option<i64> {
        sqlx::query_scalar("SELECT ref_count FROM blobs WHERE digest = ?")
            .bind(digest)
            .fetch_optional(self.state.db.pool())
            .await
            .unwrap()
    }

    pub fn content_root(&self) -> PathBuf {
        self.dir.path().join("blobs")
    }

    /// Files under the content root, staging excluded
    pub fn content_files(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![self.content_root()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if path.is_dir() {
                    pending.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        found
    }
}
