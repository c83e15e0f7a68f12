use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{Database, WriteTx};
use crate::error::{AppError, Result};
use crate::models::{Blob, BlobRef, ReclaimedBlob};
use crate::services::hasher::StagedContent;
use crate::services::locks::{KeyedGuard, KeyedLocks};
use crate::storage::{locator_for, ContentSink};

/// Content-addressed blob store.
///
/// Reference counts change only through [`BlobStore::resolve_or_create`],
/// [`BlobStore::acquire`] and [`BlobStore::release`], each a single SQL
/// statement run inside the caller's write transaction. Physical content is
/// written and removed only while holding the digest lock.
pub struct BlobStore {
    sink: Arc<dyn ContentSink>,
    digest_locks: KeyedLocks,
}

impl BlobStore {
    pub fn new(sink: Arc<dyn ContentSink>) -> Self {
        Self {
            sink,
            digest_locks: KeyedLocks::new(),
        }
    }

    pub fn sink(&self) -> &Arc<dyn ContentSink> {
        &self.sink
    }

    /// Serialize content writes and removals for one digest
    pub async fn lock_digest(&self, digest: &str) -> KeyedGuard<'_> {
        self.digest_locks.lock(digest).await
    }

    /// Move staged content to its locator unless identical content is already
    /// there. Caller must hold the digest lock. Returns the locator and
    /// whether this call wrote it.
    pub async fn promote(&self, staged: &StagedContent) -> Result<(String, bool)> {
        let locator = locator_for(&staged.digest);

        if self.sink.exists(&locator).await? {
            tracing::debug!("Content {} already stored, discarding upload", staged.digest);
            return Ok((locator, false));
        }

        self.sink.put_file(&locator, staged.path()).await?;
        Ok((locator, true))
    }

    /// Insert the blob for `digest` with one reference, or add a reference to
    /// the existing row. Runs as one atomic upsert.
    pub async fn resolve_or_create(
        tx: &mut WriteTx,
        digest: &str,
        size: i64,
        locator: &str,
    ) -> Result<BlobRef> {
        let blob: Blob = sqlx::query_as(
            r#"
            INSERT INTO blobs (id, digest, size, locator, ref_count, created_at)
            VALUES (?, ?, ?, ?, 1, ?)
            ON CONFLICT(digest) DO UPDATE SET ref_count = ref_count + 1
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(digest)
        .bind(size)
        .bind(locator)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&mut **tx)
        .await?;

        if blob.size != size {
            return Err(AppError::integrity(format!(
                "Blob {} recorded with {} bytes but content has {}",
                digest, blob.size, size
            )));
        }

        let created = blob.ref_count == 1;
        if created {
            tracing::info!("Created blob {} ({} bytes)", digest, size);
        } else {
            tracing::debug!("Blob {} now has {} references", digest, blob.ref_count);
        }

        Ok(BlobRef {
            id: blob.id,
            digest: blob.digest,
            size: blob.size,
            locator: blob.locator,
            ref_count: blob.ref_count,
            created,
        })
    }

    /// Add a reference to a blob the caller already reaches through another
    /// reference (a version entry).
    pub async fn acquire(tx: &mut WriteTx, blob_id: &str) -> Result<BlobRef> {
        let blob: Option<Blob> = sqlx::query_as(
            "UPDATE blobs SET ref_count = ref_count + 1 WHERE id = ? AND ref_count > 0 RETURNING *",
        )
        .bind(blob_id)
        .fetch_optional(&mut **tx)
        .await?;

        let blob = blob.ok_or_else(|| {
            AppError::integrity(format!("Acquire of blob {} without live references", blob_id))
        })?;

        Ok(BlobRef {
            id: blob.id,
            digest: blob.digest,
            size: blob.size,
            locator: blob.locator,
            ref_count: blob.ref_count,
            created: false,
        })
    }

    /// Drop one reference. When the count reaches zero the row is deleted in
    /// the same transaction and returned for physical reclamation after commit.
    pub async fn release(
        tx: &mut WriteTx,
        blob_id: &str,
    ) -> Result<(i64, Option<ReclaimedBlob>)> {
        let row: Option<(i64, String, String, i64)> = sqlx::query_as(
            r#"
            UPDATE blobs SET ref_count = ref_count - 1
            WHERE id = ? AND ref_count > 0
            RETURNING ref_count, digest, locator, size
            "#,
        )
        .bind(blob_id)
        .fetch_optional(&mut **tx)
        .await?;

        let (ref_count, digest, locator, size) = row.ok_or_else(|| {
            AppError::integrity(format!("Release of blob {} would underflow its reference count", blob_id))
        })?;

        if ref_count > 0 {
            tracing::debug!("Blob {} now has {} references", digest, ref_count);
            return Ok((ref_count, None));
        }

        sqlx::query("DELETE FROM blobs WHERE id = ?")
            .bind(blob_id)
            .execute(&mut **tx)
            .await?;

        Ok((0, Some(ReclaimedBlob { digest, locator, size })))
    }

    /// Get a blob by ID
    pub async fn get_blob(db: &Database, blob_id: &str) -> Result<Blob> {
        sqlx::query_as("SELECT * FROM blobs WHERE id = ?")
            .bind(blob_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("Blob not found".to_string()))
    }

    /// Find a blob by digest
    pub async fn find_by_digest(db: &Database, digest: &str) -> Result<Option<Blob>> {
        Ok(sqlx::query_as("SELECT * FROM blobs WHERE digest = ?")
            .bind(digest)
            .fetch_optional(db.pool())
            .await?)
    }

    /// Read blob content
    pub async fn read(&self, blob: &Blob) -> Result<Bytes> {
        self.sink.get(&blob.locator).await.map_err(|e| match e {
            AppError::NotFound(_) => {
                AppError::integrity(format!("Blob {} has no content at {}", blob.digest, blob.locator))
            }
            other => other,
        })
    }

    /// Remove content at `locator` unless a catalog row for `digest` exists.
    /// Caller must hold the digest lock. Missing content is not an error.
    pub async fn discard_if_unreferenced(
        &self,
        db: &Database,
        digest: &str,
        locator: &str,
    ) -> Result<bool> {
        if Self::find_by_digest(db, digest).await?.is_some() {
            return Ok(false);
        }
        self.sink.delete(locator).await
    }

    /// Physically delete content whose blob rows were removed by a committed
    /// transaction. Failures are logged and left for reconciliation.
    pub async fn reclaim(&self, db: &Database, blobs: &[ReclaimedBlob]) -> usize {
        let mut removed = 0;

        for blob in blobs {
            let _guard = self.lock_digest(&blob.digest).await;
            match self.discard_if_unreferenced(db, &blob.digest, &blob.locator).await {
                Ok(true) => {
                    tracing::info!("Reclaimed blob {} ({} bytes)", blob.digest, blob.size);
                    removed += 1;
                }
                Ok(false) => {
                    tracing::warn!("Blob {} content already gone or re-adopted", blob.digest);
                }
                Err(e) => {
                    tracing::error!("Failed to reclaim blob {}: {}", blob.digest, e);
                }
            }
        }

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;

    async fn stage(h: &TestHarness, content: &[u8]) -> StagedContent {
        h.state.hasher.stage(content).await.unwrap()
    }

    #[tokio::test]
    async fn test_resolve_or_create_then_increment() {
        let h = TestHarness::new().await;
        let staged = stage(&h, b"shared bytes").await;
        let blobs = &h.state.blobs;

        let _guard = blobs.lock_digest(&staged.digest).await;
        let (locator, written) = blobs.promote(&staged).await.unwrap();
        assert!(written);

        let mut tx = h.state.db.begin_write().await.unwrap();
        let first = BlobStore::resolve_or_create(&mut tx, &staged.digest, staged.size, &locator)
            .await
            .unwrap();
        let second = BlobStore::resolve_or_create(&mut tx, &staged.digest, staged.size, &locator)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.ref_count, 2);
        assert_eq!(h.count("SELECT COUNT(*) FROM blobs").await, 1);
    }

    #[tokio::test]
    async fn test_release_to_zero_deletes_row() {
        let h = TestHarness::new().await;
        let staged = stage(&h, b"short lived").await;
        let blobs = &h.state.blobs;
        let (locator, _) = blobs.promote(&staged).await.unwrap();

        let mut tx = h.state.db.begin_write().await.unwrap();
        let blob = BlobStore::resolve_or_create(&mut tx, &staged.digest, staged.size, &locator)
            .await
            .unwrap();
        let (count, reclaimed) = BlobStore::release(&mut tx, &blob.id).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(count, 0);
        let reclaimed = reclaimed.unwrap();
        assert_eq!(reclaimed.digest, staged.digest);
        assert_eq!(h.count("SELECT COUNT(*) FROM blobs").await, 0);

        assert_eq!(blobs.reclaim(&h.state.db, &[reclaimed.clone()]).await, 1);
        assert!(!blobs.sink().exists(&locator).await.unwrap());
        // Reclaiming again is a no-op
        assert_eq!(blobs.reclaim(&h.state.db, &[reclaimed]).await, 0);
    }

    #[tokio::test]
    async fn test_release_never_goes_negative() {
        let h = TestHarness::new().await;
        let mut tx = h.state.db.begin_write().await.unwrap();

        let result = BlobStore::release(&mut tx, "missing").await;

        assert!(matches!(result, Err(AppError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_reclaim_skips_readopted_digest() {
        let h = TestHarness::new().await;
        let staged = stage(&h, b"comes back").await;
        let blobs = &h.state.blobs;
        let (locator, _) = blobs.promote(&staged).await.unwrap();

        let mut tx = h.state.db.begin_write().await.unwrap();
        let blob = BlobStore::resolve_or_create(&mut tx, &staged.digest, staged.size, &locator)
            .await
            .unwrap();
        let (_, reclaimed) = BlobStore::release(&mut tx, &blob.id).await.unwrap();
        // Same digest admitted again before physical reclamation ran
        BlobStore::resolve_or_create(&mut tx, &staged.digest, staged.size, &locator)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(blobs.reclaim(&h.state.db, &[reclaimed.unwrap()]).await, 0);
        assert!(blobs.sink().exists(&locator).await.unwrap());
    }
}
