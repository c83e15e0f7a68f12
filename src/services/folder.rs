use chrono::Utc;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::db::{Database, WriteTx};
use crate::error::{AppError, Result};
use crate::models::{File, Folder};
use crate::services::events::DomainEvent;
use crate::services::file::FileService;
use crate::services::trash::{Reclaimer, TrashService};
use crate::AppState;

/// Folder state transitions used by trash and reclamation
pub struct FolderService;

impl FolderService {
    /// Get folder by ID
    pub async fn get_folder(db: &Database, folder_id: &str) -> Result<Folder> {
        sqlx::query_as("SELECT * FROM folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("Folder not found".to_string()))
    }

    pub async fn get_owned_folder(db: &Database, folder_id: &str, actor: &str) -> Result<Folder> {
        let folder = Self::get_folder(db, folder_id).await?;
        if folder.owner_id != actor {
            return Err(AppError::Forbidden("Access denied".to_string()));
        }
        Ok(folder)
    }

    /// Folder that can receive new entries
    pub async fn get_live_folder(db: &Database, folder_id: &str, actor: &str) -> Result<Folder> {
        let folder = Self::get_owned_folder(db, folder_id, actor).await?;
        if folder.trashed {
            return Err(AppError::Validation("Folder is in trash".to_string()));
        }
        Ok(folder)
    }

    pub async fn create_folder(
        state: &AppState,
        owner_id: &str,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<Folder> {
        FileService::validate_name(&state.config.upload, name)?;
        if let Some(pid) = parent_id {
            Self::get_live_folder(&state.db, pid, owner_id).await?;
        }

        let mut tx = state.db.begin_write().await?;

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM folders WHERE owner_id = ? AND name = ? AND parent_id IS ? AND trashed = 0",
        )
        .bind(owner_id)
        .bind(name)
        .bind(parent_id)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_some() {
            return Err(AppError::Conflict("Folder already exists".to_string()));
        }

        let folder = Folder {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            parent_id: parent_id.map(str::to_string),
            trashed: false,
            trashed_at: None,
            created_at: Utc::now().to_rfc3339(),
        };

        sqlx::query(
            "INSERT INTO folders (id, owner_id, name, parent_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&folder.id)
        .bind(&folder.owner_id)
        .bind(&folder.name)
        .bind(&folder.parent_id)
        .bind(&folder.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        state.emit(
            owner_id,
            DomainEvent::FolderCreated {
                folder_id: folder.id.clone(),
                owner_id: folder.owner_id.clone(),
                name: folder.name.clone(),
            },
        );
        Ok(folder)
    }

    /// Trash a folder with every live subfolder and file below it
    pub async fn trash_folder(state: &AppState, folder_id: &str, actor: &str) -> Result<usize> {
        let folder = Self::get_owned_folder(&state.db, folder_id, actor).await?;
        if folder.trashed {
            return Err(AppError::Validation("Folder is already in trash".to_string()));
        }

        let now = Utc::now().to_rfc3339();
        let mut tx = state.db.begin_write().await?;
        sqlx::query("UPDATE folders SET trashed = 1, trashed_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&folder.id)
            .execute(&mut *tx)
            .await?;
        let files = Self::mark_children_trashed(&mut tx, &folder.id, &now).await?;
        tx.commit().await?;

        tracing::info!("Folder {} moved to trash with {} files", folder.id, files);
        state.emit(
            actor,
            DomainEvent::FolderTrashed {
                folder_id: folder.id,
                owner_id: folder.owner_id,
            },
        );
        Ok(files)
    }

    /// Recursively trash live children, stamping them with the folder's time
    fn mark_children_trashed<'a>(
        tx: &'a mut WriteTx,
        folder_id: &'a str,
        trashed_at: &'a str,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let files = sqlx::query(
                "UPDATE files SET trashed = 1, trashed_at = ?, updated_at = ? WHERE folder_id = ? AND trashed = 0",
            )
            .bind(trashed_at)
            .bind(trashed_at)
            .bind(folder_id)
            .execute(&mut **tx)
            .await?
            .rows_affected() as usize;

            let children: Vec<String> =
                sqlx::query_scalar("SELECT id FROM folders WHERE parent_id = ? AND trashed = 0")
                    .bind(folder_id)
                    .fetch_all(&mut **tx)
                    .await?;

            let mut total = files;
            for child in children {
                sqlx::query("UPDATE folders SET trashed = 1, trashed_at = ? WHERE id = ?")
                    .bind(trashed_at)
                    .bind(&child)
                    .execute(&mut **tx)
                    .await?;
                total += Self::mark_children_trashed(&mut *tx, &child, trashed_at).await?;
            }

            Ok(total)
        })
    }

    /// Restore a trashed folder and everything that was trashed with it.
    /// Entries trashed separately beforehand stay in trash.
    pub async fn restore_folder(state: &AppState, folder_id: &str, actor: &str) -> Result<Folder> {
        let folder = Self::get_owned_folder(&state.db, folder_id, actor).await?;
        let trashed_at = match (folder.trashed, &folder.trashed_at) {
            (true, Some(at)) => at.clone(),
            _ => return Err(AppError::Validation("Folder is not in trash".to_string())),
        };

        let mut tx = state.db.begin_write().await?;

        let parent_id = match &folder.parent_id {
            Some(pid) => {
                let live: Option<i64> =
                    sqlx::query_scalar("SELECT 1 FROM folders WHERE id = ? AND trashed = 0")
                        .bind(pid)
                        .fetch_optional(&mut *tx)
                        .await?;
                live.map(|_| pid.clone())
            }
            None => None,
        };

        let name =
            Self::unique_folder_name(&mut tx, &folder.owner_id, parent_id.as_deref(), &folder.name)
                .await?;

        sqlx::query(
            "UPDATE folders SET trashed = 0, trashed_at = NULL, name = ?, parent_id = ? WHERE id = ?",
        )
        .bind(&name)
        .bind(&parent_id)
        .bind(&folder.id)
        .execute(&mut *tx)
        .await?;

        let now = Utc::now().to_rfc3339();
        Self::restore_children(&mut tx, &folder.id, &trashed_at, &now).await?;
        tx.commit().await?;

        tracing::info!("Folder {} restored", folder.id);
        state.emit(
            actor,
            DomainEvent::FolderRestored {
                folder_id: folder.id.clone(),
                owner_id: folder.owner_id.clone(),
            },
        );

        Self::get_folder(&state.db, &folder.id).await
    }

    async fn folder_name_taken(
        tx: &mut WriteTx,
        owner_id: &str,
        parent_id: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let taken: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM folders WHERE owner_id = ? AND name = ? AND parent_id IS ? AND trashed = 0",
        )
        .bind(owner_id)
        .bind(name)
        .bind(parent_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(taken.is_some())
    }

    /// `name`, or `name (1)`, `name (2)`, … when a live sibling holds it
    async fn unique_folder_name(
        tx: &mut WriteTx,
        owner_id: &str,
        parent_id: Option<&str>,
        name: &str,
    ) -> Result<String> {
        if !Self::folder_name_taken(tx, owner_id, parent_id, name).await? {
            return Ok(name.to_string());
        }

        for counter in 1..=100 {
            let candidate = format!("{} ({})", name, counter);
            if !Self::folder_name_taken(tx, owner_id, parent_id, &candidate).await? {
                return Ok(candidate);
            }
        }

        Err(AppError::Conflict("Could not generate unique name".to_string()))
    }

    fn restore_children<'a>(
        tx: &'a mut WriteTx,
        folder_id: &'a str,
        trashed_at: &'a str,
        now: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let files: Vec<File> = sqlx::query_as(
                "SELECT * FROM files WHERE folder_id = ? AND trashed = 1 AND trashed_at = ?",
            )
            .bind(folder_id)
            .bind(trashed_at)
            .fetch_all(&mut **tx)
            .await?;

            for file in files {
                TrashService::restore_file_in(&mut *tx, &file, now).await?;
            }

            let children: Vec<String> = sqlx::query_scalar(
                "SELECT id FROM folders WHERE parent_id = ? AND trashed = 1 AND trashed_at = ?",
            )
            .bind(folder_id)
            .bind(trashed_at)
            .fetch_all(&mut **tx)
            .await?;

            for child in children {
                sqlx::query("UPDATE folders SET trashed = 0, trashed_at = NULL WHERE id = ?")
                    .bind(&child)
                    .execute(&mut **tx)
                    .await?;
                Self::restore_children(&mut *tx, &child, trashed_at, now).await?;
            }

            Ok(())
        })
    }

    /// Delete a folder subtree and all files in it in one transaction
    pub async fn permanently_delete_folder(
        state: &AppState,
        folder_id: &str,
        actor: &str,
    ) -> Result<usize> {
        let folder = Self::get_owned_folder(&state.db, folder_id, actor).await?;

        let mut tx = state.db.begin_write().await?;

        let subtree: Vec<String> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE tree(id, depth) AS (
                SELECT id, 0 FROM folders WHERE id = ?
                UNION ALL
                SELECT f.id, t.depth + 1 FROM folders f JOIN tree t ON f.parent_id = t.id
            )
            SELECT id FROM tree ORDER BY depth DESC
            "#,
        )
        .bind(&folder.id)
        .fetch_all(&mut *tx)
        .await?;

        let mut reclaimed = Vec::new();
        let mut files = 0;
        for id in &subtree {
            let file_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM files WHERE folder_id = ?")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;
            for file_id in file_ids {
                reclaimed.extend(Reclaimer::purge_file(&mut tx, &file_id).await?);
                files += 1;
            }
            sqlx::query("DELETE FROM folders WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        state.blobs.reclaim(&state.db, &reclaimed).await;

        tracing::info!(
            "Folder {} permanently deleted with {} subfolders and {} files",
            folder.id,
            subtree.len().saturating_sub(1),
            files
        );
        state.emit(
            actor,
            DomainEvent::FolderDeleted {
                folder_id: folder.id,
                owner_id: folder.owner_id,
            },
        );
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UploadRequest;
    use crate::services::quota::QuotaLedger;
    use crate::test_support::TestHarness;

    async fn upload_into(h: &TestHarness, folder_id: &str, name: &str, content: &[u8]) -> String {
        let request = UploadRequest {
            name: name.to_string(),
            folder_id: Some(folder_id.to_string()),
            ..Default::default()
        };
        FileService::admit_upload(&h.state, "alice", request, content)
            .await
            .unwrap()
            .file_id
    }

    #[tokio::test]
    async fn test_trash_and_restore_cascade() {
        let h = TestHarness::new().await;
        let root = FolderService::create_folder(&h.state, "alice", "projects", None).await.unwrap();
        let child = FolderService::create_folder(&h.state, "alice", "2024", Some(&root.id))
            .await
            .unwrap();
        upload_into(&h, &root.id, "top.txt", b"top level").await;
        upload_into(&h, &child.id, "deep.txt", b"nested").await;
        let separate = upload_into(&h, &child.id, "old.txt", b"trashed earlier").await;
        TrashService::trash_file(&h.state, &separate, "alice").await.unwrap();

        let trashed = FolderService::trash_folder(&h.state, &root.id, "alice").await.unwrap();
        assert_eq!(trashed, 2);
        assert_eq!(QuotaLedger::used(&h.state.db, "alice").await.unwrap(), 0);

        FolderService::restore_folder(&h.state, &root.id, "alice").await.unwrap();
        assert_eq!(QuotaLedger::used(&h.state.db, "alice").await.unwrap(), 9 + 6);
        assert!(!FolderService::get_folder(&h.state.db, &child.id).await.unwrap().trashed);
        assert!(FileService::get_file(&h.state.db, &separate).await.unwrap().trashed);
    }

    #[tokio::test]
    async fn test_restore_subfolder_of_trashed_parent_goes_to_root() {
        let h = TestHarness::new().await;
        let root = FolderService::create_folder(&h.state, "alice", "outer", None).await.unwrap();
        let child = FolderService::create_folder(&h.state, "alice", "inner", Some(&root.id))
            .await
            .unwrap();
        FolderService::trash_folder(&h.state, &root.id, "alice").await.unwrap();

        let restored = FolderService::restore_folder(&h.state, &child.id, "alice").await.unwrap();

        assert_eq!(restored.parent_id, None);
        assert!(!restored.trashed);
    }

    #[tokio::test]
    async fn test_permanently_delete_folder_subtree() {
        let h = TestHarness::new().await;
        let root = FolderService::create_folder(&h.state, "alice", "archive", None).await.unwrap();
        let child = FolderService::create_folder(&h.state, "alice", "old", Some(&root.id))
            .await
            .unwrap();
        upload_into(&h, &root.id, "a.txt", b"archived a").await;
        upload_into(&h, &child.id, "b.txt", b"archived b").await;
        let outside = h.upload("alice", "b-copy.txt", b"archived b").await.unwrap();

        let files = FolderService::permanently_delete_folder(&h.state, &root.id, "alice")
            .await
            .unwrap();

        assert_eq!(files, 2);
        assert_eq!(h.count("SELECT COUNT(*) FROM folders").await, 0);
        assert_eq!(h.count("SELECT COUNT(*) FROM files").await, 1);
        assert_eq!(h.ref_count(&outside.blob_digest).await, Some(1));
        assert_eq!(h.content_files().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_trash_removes_trashed_folders() {
        let h = TestHarness::new().await;
        let root = FolderService::create_folder(&h.state, "alice", "tmp", None).await.unwrap();
        FolderService::create_folder(&h.state, "alice", "nested", Some(&root.id))
            .await
            .unwrap();
        upload_into(&h, &root.id, "scratch.txt", b"scratch").await;
        FolderService::trash_folder(&h.state, &root.id, "alice").await.unwrap();

        let report = TrashService::empty_trash(&h.state, "alice").await.unwrap();

        assert_eq!(report.files, 1);
        assert_eq!(report.folders, 2);
        assert_eq!(h.count("SELECT COUNT(*) FROM folders").await, 0);
    }

    #[tokio::test]
    async fn test_folder_name_conflict_and_ownership() {
        let h = TestHarness::new().await;
        let folder = FolderService::create_folder(&h.state, "alice", "docs", None).await.unwrap();

        assert!(matches!(
            FolderService::create_folder(&h.state, "alice", "docs", None).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            FolderService::trash_folder(&h.state, &folder.id, "bob").await,
            Err(AppError::Forbidden(_))
        ));
        assert!(FolderService::create_folder(&h.state, "bob", "docs", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_restore_folder_renames_on_collision() {
        let h = TestHarness::new().await;
        let old = FolderService::create_folder(&h.state, "alice", "docs", None).await.unwrap();
        FolderService::trash_folder(&h.state, &old.id, "alice").await.unwrap();
        FolderService::create_folder(&h.state, "alice", "docs", None).await.unwrap();

        let restored = FolderService::restore_folder(&h.state, &old.id, "alice").await.unwrap();

        assert_eq!(restored.name, "docs (1)");
        assert!(!restored.trashed);
        assert_eq!(
            h.count("SELECT COUNT(*) FROM folders WHERE name = 'docs' AND trashed = 0").await,
            1
        );
    }
}
