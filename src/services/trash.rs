use chrono::Utc;
use serde::Serialize;

use crate::db::{Database, WriteTx};
use crate::error::{AppError, Result};
use crate::models::{
    File, FileListItem, FileListRow, FileResponse, Folder, ReclaimedBlob, TrashListing,
};
use crate::services::blob_store::BlobStore;
use crate::services::events::DomainEvent;
use crate::services::file::FileService;
use crate::AppState;

/// Result of emptying an owner's trash
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EmptyTrashReport {
    pub files: usize,
    pub folders: usize,
    pub blobs_reclaimed: usize,
    pub bytes_reclaimed: i64,
}

/// Catalog rows removed by a sweep, plus blobs awaiting physical deletion
#[derive(Debug, Default)]
pub struct Sweep {
    pub files: usize,
    pub folders: usize,
    pub reclaimed: Vec<ReclaimedBlob>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orphans_removed: usize,
    pub staging_removed: usize,
}

/// Soft delete, restore and permanent delete of files
pub struct TrashService;

impl TrashService {
    /// Move a file to trash. Its blob reference is kept.
    pub async fn trash_file(state: &AppState, file_id: &str, actor: &str) -> Result<()> {
        let file = FileService::get_owned_file(&state.db, file_id, actor).await?;
        if file.trashed {
            return Err(AppError::Validation("File is already in trash".to_string()));
        }

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE files SET trashed = 1, trashed_at = ?, updated_at = ? WHERE id = ? AND trashed = 0",
        )
        .bind(&now)
        .bind(&now)
        .bind(&file.id)
        .execute(state.db.pool())
        .await?;

        // Lost a race with another trash request
        if result.rows_affected() == 0 {
            return Err(AppError::Validation("File is already in trash".to_string()));
        }

        tracing::info!("File {} moved to trash", file.id);
        state.emit(
            actor,
            DomainEvent::FileTrashed {
                file_id: file.id,
                owner_id: file.owner_id,
            },
        );
        Ok(())
    }

    /// Trashed files and folders of an owner
    pub async fn list_trash(db: &Database, owner_id: &str) -> Result<TrashListing> {
        let files: Vec<FileListRow> = sqlx::query_as(
            r#"
            SELECT f.*, b.size, b.digest
            FROM files f
            JOIN blobs b ON f.blob_id = b.id
            WHERE f.owner_id = ? AND f.trashed = 1
            ORDER BY f.trashed_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(db.pool())
        .await?;

        let folders: Vec<Folder> = sqlx::query_as(
            "SELECT * FROM folders WHERE owner_id = ? AND trashed = 1 ORDER BY trashed_at DESC",
        )
        .bind(owner_id)
        .fetch_all(db.pool())
        .await?;

        Ok(TrashListing {
            files: files.into_iter().map(FileListItem::from).collect(),
            folders,
        })
    }

    /// Restore a trashed file. A trashed or missing folder sends it to the
    /// root; an occupied name gets a numbered suffix.
    pub async fn restore_file(state: &AppState, file_id: &str, actor: &str) -> Result<FileResponse> {
        let file = FileService::get_owned_file(&state.db, file_id, actor).await?;
        if !file.trashed {
            return Err(AppError::Validation("File is not in trash".to_string()));
        }

        let mut tx = state.db.begin_write().await?;
        let now = Utc::now().to_rfc3339();
        let (name, folder_id) = Self::restore_file_in(&mut tx, &file, &now).await?;
        tx.commit().await?;

        tracing::info!("File {} restored as {}", file.id, name);
        state.emit(
            actor,
            DomainEvent::FileRestored {
                file_id: file.id.clone(),
                owner_id: file.owner_id.clone(),
                name,
                folder_id,
            },
        );

        let file = FileService::get_file(&state.db, &file.id).await?;
        Ok(FileResponse::from(file))
    }

    /// Restore one file inside the caller's transaction
    pub(crate) async fn restore_file_in(
        tx: &mut WriteTx,
        file: &File,
        now: &str,
    ) -> Result<(String, Option<String>)> {
        let folder_id = match &file.folder_id {
            Some(folder_id) => {
                let live: Option<i64> =
                    sqlx::query_scalar("SELECT 1 FROM folders WHERE id = ? AND trashed = 0")
                        .bind(folder_id)
                        .fetch_optional(&mut **tx)
                        .await?;
                live.map(|_| folder_id.clone())
            }
            None => None,
        };

        let name = if Self::name_taken(tx, &file.owner_id, folder_id.as_deref(), &file.name).await? {
            Self::unique_name(tx, &file.owner_id, folder_id.as_deref(), &file.name).await?
        } else {
            file.name.clone()
        };

        sqlx::query(
            "UPDATE files SET trashed = 0, trashed_at = NULL, name = ?, folder_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&name)
        .bind(&folder_id)
        .bind(now)
        .bind(&file.id)
        .execute(&mut **tx)
        .await?;

        Ok((name, folder_id))
    }

    async fn name_taken(
        tx: &mut WriteTx,
        owner_id: &str,
        folder_id: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let taken: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM files WHERE owner_id = ? AND name = ? AND folder_id IS ? AND trashed = 0",
        )
        .bind(owner_id)
        .bind(name)
        .bind(folder_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(taken.is_some())
    }

    /// `name (1).ext`, `name (2).ext`, … until one is free
    async fn unique_name(
        tx: &mut WriteTx,
        owner_id: &str,
        folder_id: Option<&str>,
        original_name: &str,
    ) -> Result<String> {
        let (base_name, extension) = match original_name.rfind('.') {
            Some(dot_pos) if dot_pos > 0 => (&original_name[..dot_pos], &original_name[dot_pos..]),
            _ => (original_name, ""),
        };

        for counter in 1..=100 {
            let candidate = format!("{} ({}){}", base_name, counter, extension);
            if !Self::name_taken(tx, owner_id, folder_id, &candidate).await? {
                return Ok(candidate);
            }
        }

        Err(AppError::Conflict("Could not generate unique name".to_string()))
    }

    /// Delete a file, live or trashed, with its whole version history
    pub async fn permanently_delete(state: &AppState, file_id: &str, actor: &str) -> Result<()> {
        let file = FileService::get_owned_file(&state.db, file_id, actor).await?;

        let mut tx = state.db.begin_write().await?;
        let reclaimed = Reclaimer::purge_file(&mut tx, &file.id).await?;
        tx.commit().await?;

        state.blobs.reclaim(&state.db, &reclaimed).await;

        tracing::info!("File {} permanently deleted", file.id);
        state.emit(
            actor,
            DomainEvent::FileDeleted {
                file_id: file.id,
                owner_id: file.owner_id,
            },
        );
        Ok(())
    }

    /// Permanently delete every trashed file and folder of an owner, all or nothing
    pub async fn empty_trash(state: &AppState, owner_id: &str) -> Result<EmptyTrashReport> {
        let mut tx = state.db.begin_write().await?;
        let sweep = Reclaimer::sweep(&mut tx, owner_id).await?;
        tx.commit().await?;

        let blobs_reclaimed = state.blobs.reclaim(&state.db, &sweep.reclaimed).await;
        let report = EmptyTrashReport {
            files: sweep.files,
            folders: sweep.folders,
            blobs_reclaimed,
            bytes_reclaimed: sweep.reclaimed.iter().map(|b| b.size).sum(),
        };

        tracing::info!(
            "Emptied trash of {}: {} files, {} folders, {} blobs reclaimed",
            owner_id,
            report.files,
            report.folders,
            report.blobs_reclaimed
        );
        state.emit(
            owner_id,
            DomainEvent::TrashEmptied {
                owner_id: owner_id.to_string(),
                files: report.files,
                folders: report.folders,
            },
        );
        Ok(report)
    }
}

/// Catalog side of reclamation plus recovery of content left behind by crashes
pub struct Reclaimer;

impl Reclaimer {
    /// Delete a file row and its versions, releasing every blob they held
    pub async fn purge_file(tx: &mut WriteTx, file_id: &str) -> Result<Vec<ReclaimedBlob>> {
        let current: Option<String> = sqlx::query_scalar("SELECT blob_id FROM files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(&mut **tx)
            .await?;
        let current = current.ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

        let mut held: Vec<String> =
            sqlx::query_scalar("SELECT blob_id FROM file_versions WHERE file_id = ? ORDER BY version_number")
                .bind(file_id)
                .fetch_all(&mut **tx)
                .await?;
        held.push(current);

        sqlx::query("DELETE FROM file_versions WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&mut **tx)
            .await?;

        let mut reclaimed = Vec::new();
        for blob_id in held {
            if let (_, Some(blob)) = BlobStore::release(tx, &blob_id).await? {
                reclaimed.push(blob);
            }
        }
        Ok(reclaimed)
    }

    /// Remove all of an owner's trashed files and folders inside `tx`.
    /// Nothing is visible to others until the caller commits.
    pub async fn sweep(tx: &mut WriteTx, owner_id: &str) -> Result<Sweep> {
        let mut sweep = Sweep::default();

        let trashed: Vec<String> =
            sqlx::query_scalar("SELECT id FROM files WHERE owner_id = ? AND trashed = 1")
                .bind(owner_id)
                .fetch_all(&mut **tx)
                .await?;

        for file_id in trashed {
            sweep.reclaimed.extend(Self::purge_file(tx, &file_id).await?);
            sweep.files += 1;
        }

        // Live entries left under a trashed folder fall back to the root
        sqlx::query(
            r#"
            UPDATE files SET folder_id = NULL
            WHERE folder_id IN (SELECT id FROM folders WHERE owner_id = ? AND trashed = 1)
            "#,
        )
        .bind(owner_id)
        .execute(&mut **tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE folders SET parent_id = NULL
            WHERE trashed = 0 AND parent_id IN (SELECT id FROM folders WHERE owner_id = ? AND trashed = 1)
            "#,
        )
        .bind(owner_id)
        .execute(&mut **tx)
        .await?;

        // Leaves first, until no trashed folder remains
        loop {
            let deleted = sqlx::query(
                r#"
                DELETE FROM folders
                WHERE owner_id = ? AND trashed = 1
                AND id NOT IN (SELECT parent_id FROM folders WHERE parent_id IS NOT NULL)
                "#,
            )
            .bind(owner_id)
            .execute(&mut **tx)
            .await?
            .rows_affected();

            if deleted == 0 {
                break;
            }
            sweep.folders += deleted as usize;
        }

        Ok(sweep)
    }

    /// Delete content with no catalog row and any leftover staging files.
    /// Only safe while no upload is in flight, i.e. at startup.
    pub async fn reconcile(state: &AppState) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            orphans_removed: 0,
            staging_removed: 0,
        };

        for locator in state.blobs.sink().list().await? {
            let digest = locator.rsplit('/').next().unwrap_or_default().to_string();
            let _guard = state.blobs.lock_digest(&digest).await;
            if state
                .blobs
                .discard_if_unreferenced(&state.db, &digest, &locator)
                .await?
            {
                tracing::warn!("Removed orphaned content {}", locator);
                report.orphans_removed += 1;
            }
        }

        let staging_dir = state.hasher.staging_dir();
        match tokio::fs::read_dir(staging_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_file() {
                        tokio::fs::remove_file(entry.path()).await?;
                        report.staging_removed += 1;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            "Reconciliation removed {} orphaned blobs and {} staging files",
            report.orphans_removed,
            report.staging_removed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::quota::QuotaLedger;
    use crate::storage::locator_for;
    use crate::test_support::TestHarness;

    #[tokio::test]
    async fn test_permanent_delete_releases_references() {
        let h = TestHarness::new().await;
        let a = h.upload("alice", "a.txt", b"shared payload").await.unwrap();
        let b = h.upload("bob", "b.txt", b"shared payload").await.unwrap();
        let locator = locator_for(&a.blob_digest);

        TrashService::permanently_delete(&h.state, &a.file_id, "alice").await.unwrap();
        assert_eq!(h.ref_count(&a.blob_digest).await, Some(1));
        assert!(h.state.blobs.sink().exists(&locator).await.unwrap());

        TrashService::permanently_delete(&h.state, &b.file_id, "bob").await.unwrap();
        assert_eq!(h.ref_count(&a.blob_digest).await, None);
        assert!(!h.state.blobs.sink().exists(&locator).await.unwrap());
    }

    #[tokio::test]
    async fn test_permanent_delete_releases_versions() {
        let h = TestHarness::new().await;
        let first = h.upload("alice", "doc.txt", b"v1").await.unwrap();
        let second = h.upload("alice", "doc.txt", b"v2").await.unwrap();

        TrashService::permanently_delete(&h.state, &first.file_id, "alice").await.unwrap();

        assert_eq!(h.ref_count(&first.blob_digest).await, None);
        assert_eq!(h.ref_count(&second.blob_digest).await, None);
        assert_eq!(h.count("SELECT COUNT(*) FROM file_versions").await, 0);
        assert!(h.content_files().is_empty());
    }

    #[tokio::test]
    async fn test_trash_and_restore_move_usage() {
        let h = TestHarness::new().await;
        let receipt = h.upload("alice", "big.txt", &[b'x'; 400]).await.unwrap();

        TrashService::trash_file(&h.state, &receipt.file_id, "alice").await.unwrap();
        assert_eq!(QuotaLedger::used(&h.state.db, "alice").await.unwrap(), 0);
        // Still referenced while in trash
        assert_eq!(h.ref_count(&receipt.blob_digest).await, Some(1));

        TrashService::restore_file(&h.state, &receipt.file_id, "alice").await.unwrap();
        assert_eq!(QuotaLedger::used(&h.state.db, "alice").await.unwrap(), 400);
    }

    #[tokio::test]
    async fn test_trashed_name_is_free_for_new_upload() {
        let h = TestHarness::new().await;
        let old = h.upload("alice", "report.txt", b"old report").await.unwrap();
        TrashService::trash_file(&h.state, &old.file_id, "alice").await.unwrap();

        let new = h.upload("alice", "report.txt", b"new report").await.unwrap();
        assert_ne!(old.file_id, new.file_id);
        assert_eq!(new.version, None);

        let restored = TrashService::restore_file(&h.state, &old.file_id, "alice").await.unwrap();
        assert_eq!(restored.name, "report (1).txt");
    }

    #[tokio::test]
    async fn test_empty_trash_shared_blob() {
        let h = TestHarness::new().await;
        let a = h.upload("alice", "one.txt", b"twin content").await.unwrap();
        let b = h.upload("alice", "two.txt", b"twin content").await.unwrap();
        TrashService::trash_file(&h.state, &a.file_id, "alice").await.unwrap();
        TrashService::trash_file(&h.state, &b.file_id, "alice").await.unwrap();
        assert_eq!(h.ref_count(&a.blob_digest).await, Some(2));

        let report = TrashService::empty_trash(&h.state, "alice").await.unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(report.blobs_reclaimed, 1);
        assert_eq!(report.bytes_reclaimed, 12);
        assert_eq!(h.count("SELECT COUNT(*) FROM files").await, 0);
        assert_eq!(h.count("SELECT COUNT(*) FROM blobs").await, 0);
        assert!(h.content_files().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_rolls_back_when_not_committed() {
        let h = TestHarness::new().await;
        let a = h.upload("alice", "one.txt", b"twin content").await.unwrap();
        let b = h.upload("alice", "two.txt", b"twin content").await.unwrap();
        TrashService::trash_file(&h.state, &a.file_id, "alice").await.unwrap();
        TrashService::trash_file(&h.state, &b.file_id, "alice").await.unwrap();

        {
            let mut tx = h.state.db.begin_write().await.unwrap();
            let sweep = Reclaimer::sweep(&mut tx, "alice").await.unwrap();
            assert_eq!(sweep.files, 2);
            assert_eq!(sweep.reclaimed.len(), 1);
            // Crash before commit: the transaction is dropped
        }

        assert_eq!(h.count("SELECT COUNT(*) FROM files").await, 2);
        assert_eq!(h.ref_count(&a.blob_digest).await, Some(2));
        assert_eq!(h.content_files().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_trash_leaves_live_files() {
        let h = TestHarness::new().await;
        let keep = h.upload("alice", "keep.txt", b"keep me").await.unwrap();
        let gone = h.upload("alice", "gone.txt", b"keep me").await.unwrap();
        TrashService::trash_file(&h.state, &gone.file_id, "alice").await.unwrap();

        let report = TrashService::empty_trash(&h.state, "alice").await.unwrap();

        assert_eq!(report.files, 1);
        assert_eq!(report.blobs_reclaimed, 0);
        assert_eq!(h.ref_count(&keep.blob_digest).await, Some(1));
        assert_eq!(h.content_files().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_removes_orphans_only() {
        let h = TestHarness::new().await;
        let live = h.upload("alice", "live.txt", b"still referenced").await.unwrap();

        let orphan_digest = "ab".repeat(32);
        let orphan_path = h.content_root().join(locator_for(&orphan_digest));
        std::fs::create_dir_all(orphan_path.parent().unwrap()).unwrap();
        std::fs::write(&orphan_path, b"leaked").unwrap();
        std::fs::create_dir_all(h.state.hasher.staging_dir()).unwrap();
        std::fs::write(h.state.hasher.staging_dir().join("stale"), b"partial").unwrap();

        let report = Reclaimer::reconcile(&h.state).await.unwrap();

        assert_eq!(report.orphans_removed, 1);
        assert_eq!(report.staging_removed, 1);
        assert!(!orphan_path.exists());
        assert!(h
            .state
            .blobs
            .sink()
            .exists(&locator_for(&live.blob_digest))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_trash_and_restore_move_between_listings() {
        let h = TestHarness::new().await;
        let receipt = h.upload("alice", "notes.txt", b"some notes").await.unwrap();
        h.upload("alice", "other.txt", b"other notes").await.unwrap();

        TrashService::trash_file(&h.state, &receipt.file_id, "alice").await.unwrap();

        let live = FileService::list_files(&h.state.db, "alice", None).await.unwrap();
        assert_eq!(live.len(), 1);
        assert!(live.iter().all(|f| f.file.id != receipt.file_id));
        let trash = TrashService::list_trash(&h.state.db, "alice").await.unwrap();
        assert_eq!(trash.files.len(), 1);
        assert_eq!(trash.files[0].file.id, receipt.file_id);
        assert_eq!(trash.files[0].size, 10);
        assert!(TrashService::list_trash(&h.state.db, "bob").await.unwrap().files.is_empty());

        TrashService::restore_file(&h.state, &receipt.file_id, "alice").await.unwrap();

        let live = FileService::list_files(&h.state.db, "alice", None).await.unwrap();
        assert_eq!(live.len(), 2);
        assert!(TrashService::list_trash(&h.state.db, "alice").await.unwrap().files.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_trash_succeeds_once() {
        let h = TestHarness::new().await;
        let receipt = h.upload("alice", "once.txt", b"trash me once").await.unwrap();
        let mut events = h.state.events.subscribe();

        let (first, second) = tokio::join!(
            TrashService::trash_file(&h.state, &receipt.file_id, "alice"),
            TrashService::trash_file(&h.state, &receipt.file_id, "alice"),
        );

        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(
            first.err().or(second.err()),
            Some(AppError::Validation(_))
        ));
        assert!(matches!(events.recv().await.unwrap(), DomainEvent::FileTrashed { .. }));
        assert!(events.try_recv().is_err());
    }
}
