use chrono::Utc;

use crate::db::WriteTx;
use crate::error::{AppError, Result};
use crate::models::{File, VersionEntry, VersionListResponse, VersionRestoreResponse};
use crate::services::blob_store::BlobStore;
use crate::services::events::DomainEvent;
use crate::services::file::FileService;
use crate::services::mime::preview_eligible;
use crate::AppState;

/// Append-only per-file history of replaced content
pub struct VersionService;

impl VersionService {
    /// Append the next version for `file_id`, taking over the reference the
    /// file held on `blob_id`. Number assignment and insert are one statement.
    pub async fn record_version(
        tx: &mut WriteTx,
        file_id: &str,
        blob_id: &str,
        mime_type: &str,
    ) -> Result<i64> {
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO file_versions (file_id, version_number, blob_id, mime_type, created_at)
            SELECT ?, COALESCE(MAX(version_number), 0) + 1, ?, ?, ?
            FROM file_versions WHERE file_id = ?
            RETURNING version_number
            "#,
        )
        .bind(file_id)
        .bind(blob_id)
        .bind(mime_type)
        .bind(Utc::now().to_rfc3339())
        .bind(file_id)
        .fetch_one(&mut **tx)
        .await?;

        tracing::debug!("Recorded version {} of file {}", version, file_id);
        Ok(version)
    }

    /// Versions of a file, newest first
    pub async fn list_versions(
        state: &AppState,
        file_id: &str,
        actor: &str,
    ) -> Result<VersionListResponse> {
        let file = FileService::get_owned_file(&state.db, file_id, actor).await?;

        let versions: Vec<VersionEntry> = sqlx::query_as(
            r#"
            SELECT v.version_number, b.digest, b.size, v.mime_type, v.created_at
            FROM file_versions v
            JOIN blobs b ON b.id = v.blob_id
            WHERE v.file_id = ?
            ORDER BY v.version_number DESC
            "#,
        )
        .bind(&file.id)
        .fetch_all(state.db.pool())
        .await?;

        Ok(VersionListResponse {
            file_id: file.id,
            versions,
        })
    }

    /// Make version `version_number` the file's current content. The content
    /// being replaced is kept as the next version.
    pub async fn restore_version(
        state: &AppState,
        file_id: &str,
        actor: &str,
        version_number: i64,
    ) -> Result<VersionRestoreResponse> {
        let file = FileService::get_owned_file(&state.db, file_id, actor).await?;
        if file.trashed {
            return Err(AppError::Validation("File is in trash".to_string()));
        }

        let (target_blob, target_size): (String, i64) = sqlx::query_as(
            r#"
            SELECT v.blob_id, b.size FROM file_versions v
            JOIN blobs b ON b.id = v.blob_id
            WHERE v.file_id = ? AND v.version_number = ?
            "#,
        )
        .bind(file_id)
        .bind(version_number)
        .fetch_optional(state.db.pool())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Version {} not found", version_number)))?;

        let current_size = BlobStore::get_blob(&state.db, &file.blob_id).await?.size;
        let growth = target_size - current_size;
        let _reservation = if growth > 0 {
            Some(state.quota.admit(&state.db, &file.owner_id, growth).await?)
        } else {
            None
        };

        let max_retries = state.config.upload.max_conflict_retries;
        let mut attempt = 0;
        let snapshot_version = loop {
            match Self::try_restore(state, &file, version_number, &target_blob).await {
                Err(e) if e.is_transient() && attempt < max_retries => {
                    attempt += 1;
                    tracing::debug!("Retrying version restore of {} ({}): {}", file_id, attempt, e);
                }
                other => break other?,
            }
        };

        tracing::info!(
            "Restored version {} of file {} (previous content kept as version {})",
            version_number,
            file_id,
            snapshot_version
        );

        state.emit(
            actor,
            DomainEvent::VersionRestored {
                file_id: file.id.clone(),
                owner_id: file.owner_id.clone(),
                restored_version: version_number,
                snapshot_version,
            },
        );

        Ok(VersionRestoreResponse {
            file_id: file.id,
            restored_version: version_number,
            snapshot_version,
        })
    }

    async fn try_restore(
        state: &AppState,
        file: &File,
        version_number: i64,
        target_blob: &str,
    ) -> Result<i64> {
        let mut tx = state.db.begin_write().await?;

        // Re-read under the write lock; a concurrent upload may have moved it on
        let current: Option<File> = sqlx::query_as("SELECT * FROM files WHERE id = ? AND trashed = 0")
            .bind(&file.id)
            .fetch_optional(&mut *tx)
            .await?;
        let current = current.ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

        let target_mime: String = sqlx::query_scalar(
            "SELECT mime_type FROM file_versions WHERE file_id = ? AND version_number = ?",
        )
        .bind(&file.id)
        .bind(version_number)
        .fetch_one(&mut *tx)
        .await?;

        let snapshot =
            Self::record_version(&mut tx, &current.id, &current.blob_id, &current.mime_type).await?;
        BlobStore::acquire(&mut tx, target_blob).await?;

        sqlx::query(
            "UPDATE files SET blob_id = ?, mime_type = ?, preview_eligible = ?, updated_at = ? WHERE id = ?",
        )
        .bind(target_blob)
        .bind(&target_mime)
        .bind(preview_eligible(&target_mime))
        .bind(Utc::now().to_rfc3339())
        .bind(&current.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reupload_records_previous_content() {
        let h = TestHarness::new().await;
        let first = h.upload("alice", "notes.txt", b"draft one").await.unwrap();
        let second = h.upload("alice", "notes.txt", b"draft two").await.unwrap();

        assert_eq!(first.file_id, second.file_id);
        assert_eq!(first.version, None);
        assert_eq!(second.version, Some(1));
        assert_eq!(h.count("SELECT COUNT(*) FROM files").await, 1);

        let listing = VersionService::list_versions(&h.state, &first.file_id, "alice")
            .await
            .unwrap();
        assert_eq!(listing.versions.len(), 1);
        assert_eq!(listing.versions[0].digest, first.blob_digest);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reuploads_have_gapless_versions() {
        let h = Arc::new(TestHarness::new().await);
        h.upload("alice", "log.txt", b"initial").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.upload("alice", "log.txt", format!("revision {}", i).as_bytes())
                    .await
                    .unwrap()
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap().version.unwrap());
        }
        versions.sort_unstable();

        assert_eq!(versions, (1..=10).collect::<Vec<i64>>());
        assert_eq!(h.count("SELECT COUNT(*) FROM files").await, 1);
        assert_eq!(h.count("SELECT MAX(version_number) FROM file_versions").await, 10);
    }

    #[tokio::test]
    async fn test_restore_version_snapshots_current() {
        let h = TestHarness::new().await;
        let v1 = h.upload("alice", "plan.txt", b"first plan").await.unwrap();
        h.upload("alice", "plan.txt", b"second plan").await.unwrap();

        let restored = VersionService::restore_version(&h.state, &v1.file_id, "alice", 1)
            .await
            .unwrap();
        assert_eq!(restored.snapshot_version, 2);

        let (_, bytes) = FileService::download(&h.state, &v1.file_id, "alice").await.unwrap();
        assert_eq!(&bytes[..], b"first plan");

        // Current pointer plus version 1 both reference the first blob
        assert_eq!(h.ref_count(&v1.blob_digest).await, Some(2));

        let listing = VersionService::list_versions(&h.state, &v1.file_id, "alice")
            .await
            .unwrap();
        let numbers: Vec<i64> = listing.versions.iter().map(|v| v.version_number).collect();
        assert_eq!(numbers, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_restore_missing_version() {
        let h = TestHarness::new().await;
        let receipt = h.upload("alice", "solo.txt", b"only").await.unwrap();

        let result = VersionService::restore_version(&h.state, &receipt.file_id, "alice", 3).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));

        let result = VersionService::list_versions(&h.state, &receipt.file_id, "mallory").await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }
}
