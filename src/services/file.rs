use bytes::Bytes;
use chrono::Utc;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::config::UploadConfig;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    File, FileListItem, FileListRow, FileResponse, UploadOutcome, UploadReceipt, UploadRequest,
};
use crate::services::blob_store::BlobStore;
use crate::services::events::DomainEvent;
use crate::services::folder::FolderService;
use crate::services::hasher::StagedContent;
use crate::services::mime::{mime_matches, preview_eligible, SNIFF_LEN};
use crate::services::version::VersionService;
use crate::AppState;

/// File service: admission pipeline and per-file operations
pub struct FileService;

impl FileService {
    /// Admit one uploaded byte stream.
    ///
    /// Validation, MIME check, hashing and the quota decision all happen
    /// before any catalog or content mutation. The blob upsert and the file
    /// row (or in-place version) commit in one transaction.
    pub async fn admit_upload<R>(
        state: &AppState,
        owner_id: &str,
        request: UploadRequest,
        content: R,
    ) -> Result<UploadReceipt>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut request = request;
        Self::validate_name(&state.config.upload, &request.name)?;
        request.tags = Self::normalize_tags(&state.config.upload, &request.tags)?;
        if let Some(folder_id) = &request.folder_id {
            FolderService::get_live_folder(&state.db, folder_id, owner_id).await?;
        }

        // Sniff the leading bytes, then hash them together with the rest
        let mut content = content;
        let head = Self::read_head(&mut content).await?;
        let mime = state.sniffer.sniff(&head);
        if !mime_matches(request.declared_mime.as_deref(), &mime) {
            return Err(AppError::Validation(format!(
                "Declared type {} does not match content type {}",
                request.declared_mime.as_deref().unwrap_or_default(),
                mime
            )));
        }

        let staged = state.hasher.stage(Cursor::new(head).chain(content)).await?;

        let reservation = state.quota.admit(&state.db, owner_id, staged.size).await?;

        let receipt = {
            let _digest_guard = state.blobs.lock_digest(&staged.digest).await;
            let (locator, _) = state.blobs.promote(&staged).await?;

            let result = Self::commit_with_retry(state, owner_id, &request, &staged, &locator, &mime).await;
            if result.is_err() {
                if let Err(e) = state
                    .blobs
                    .discard_if_unreferenced(&state.db, &staged.digest, &locator)
                    .await
                {
                    tracing::error!("Failed to discard content {}: {}", staged.digest, e);
                }
            }
            result?
        };
        drop(reservation);

        tracing::info!(
            "Admitted {} for {} ({} bytes, {}, deduplicated: {})",
            request.name,
            owner_id,
            receipt.size,
            receipt.mime,
            receipt.deduplicated
        );

        state.emit(
            owner_id,
            DomainEvent::FileUploaded {
                file_id: receipt.file_id.clone(),
                owner_id: owner_id.to_string(),
                blob_digest: receipt.blob_digest.clone(),
                size: receipt.size,
                mime: receipt.mime.clone(),
                tags: request.tags.clone(),
                folder_id: request.folder_id.clone(),
                version: receipt.version,
            },
        );

        Ok(receipt)
    }

    /// Run every item through the pipeline independently
    pub async fn admit_batch<R>(
        state: &AppState,
        owner_id: &str,
        items: Vec<(UploadRequest, R)>,
    ) -> Vec<UploadOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut outcomes = Vec::with_capacity(items.len());

        for (request, content) in items {
            let name = request.name.clone();
            match Self::admit_upload(state, owner_id, request, content).await {
                Ok(receipt) => outcomes.push(UploadOutcome::Admitted(receipt)),
                Err(e) => {
                    tracing::warn!("Rejected {} for {}: {}", name, owner_id, e);
                    outcomes.push(UploadOutcome::Rejected {
                        name,
                        reason: e.reason().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        outcomes
    }

    async fn read_head<R>(content: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = vec![0u8; SNIFF_LEN];
        let mut filled = 0;
        while filled < SNIFF_LEN {
            let n = content.read(&mut head[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        head.truncate(filled);
        Ok(head)
    }

    async fn commit_with_retry(
        state: &AppState,
        owner_id: &str,
        request: &UploadRequest,
        staged: &StagedContent,
        locator: &str,
        mime: &str,
    ) -> Result<UploadReceipt> {
        let max_retries = state.config.upload.max_conflict_retries;
        let mut attempt = 0;

        loop {
            match Self::record_upload(state, owner_id, request, staged, locator, mime).await {
                Err(e) if e.is_transient() => {
                    if attempt >= max_retries {
                        tracing::error!("Upload of {} still conflicting after {} retries: {}", request.name, attempt, e);
                        return Err(AppError::Conflict(
                            "Upload could not be committed, try again".to_string(),
                        ));
                    }
                    attempt += 1;
                    tracing::debug!("Retrying upload of {} ({}): {}", request.name, attempt, e);
                }
                other => return other,
            }
        }
    }

    /// Blob upsert plus file insert or in-place version, one transaction
    async fn record_upload(
        state: &AppState,
        owner_id: &str,
        request: &UploadRequest,
        staged: &StagedContent,
        locator: &str,
        mime: &str,
    ) -> Result<UploadReceipt> {
        let mut tx = state.db.begin_write().await?;

        // Folder may have been trashed since validation
        if let Some(folder_id) = &request.folder_id {
            let live: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM folders WHERE id = ? AND owner_id = ? AND trashed = 0",
            )
            .bind(folder_id)
            .bind(owner_id)
            .fetch_optional(&mut *tx)
            .await?;
            if live.is_none() {
                return Err(AppError::Validation("Folder is no longer available".to_string()));
            }
        }

        let blob = BlobStore::resolve_or_create(&mut tx, &staged.digest, staged.size, locator).await?;

        let existing: Option<File> = sqlx::query_as(
            "SELECT * FROM files WHERE owner_id = ? AND name = ? AND folder_id IS ? AND trashed = 0",
        )
        .bind(owner_id)
        .bind(&request.name)
        .bind(&request.folder_id)
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now().to_rfc3339();
        let preview = preview_eligible(mime);

        let (file_id, version) = match existing {
            Some(file) => {
                // The old content moves into history along with its reference
                let version =
                    VersionService::record_version(&mut tx, &file.id, &file.blob_id, &file.mime_type)
                        .await?;

                let tags = if request.tags.is_empty() {
                    file.tags.clone()
                } else {
                    Self::encode_tags(&request.tags)?
                };

                sqlx::query(
                    r#"
                    UPDATE files SET blob_id = ?, mime_type = ?, tags = ?, preview_eligible = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&blob.id)
                .bind(mime)
                .bind(&tags)
                .bind(preview)
                .bind(&now)
                .bind(&file.id)
                .execute(&mut *tx)
                .await?;

                (file.id, Some(version))
            }
            None => {
                let file_id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO files (id, owner_id, name, folder_id, blob_id, mime_type, tags, preview_eligible, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&file_id)
                .bind(owner_id)
                .bind(&request.name)
                .bind(&request.folder_id)
                .bind(&blob.id)
                .bind(mime)
                .bind(Self::encode_tags(&request.tags)?)
                .bind(preview)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;

                (file_id, None)
            }
        };

        tx.commit().await?;

        Ok(UploadReceipt {
            file_id,
            blob_digest: blob.digest,
            size: blob.size,
            mime: mime.to_string(),
            version,
            deduplicated: !blob.created,
        })
    }

    /// Get file by ID
    pub async fn get_file(db: &Database, file_id: &str) -> Result<File> {
        sqlx::query_as("SELECT * FROM files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))
    }

    /// Get file by ID, checking the caller owns it
    pub async fn get_owned_file(db: &Database, file_id: &str, actor: &str) -> Result<File> {
        let file = Self::get_file(db, file_id).await?;
        if file.owner_id != actor {
            return Err(AppError::Forbidden("Access denied".to_string()));
        }
        Ok(file)
    }

    /// Live files of an owner, newest first, optionally limited to one folder
    pub async fn list_files(
        db: &Database,
        owner_id: &str,
        folder_id: Option<&str>,
    ) -> Result<Vec<FileListItem>> {
        if let Some(folder_id) = folder_id {
            FolderService::get_owned_folder(db, folder_id, owner_id).await?;
        }

        let rows: Vec<FileListRow> = sqlx::query_as(
            r#"
            SELECT f.*, b.size, b.digest
            FROM files f
            JOIN blobs b ON f.blob_id = b.id
            WHERE f.owner_id = ? AND f.trashed = 0 AND (? IS NULL OR f.folder_id = ?)
            ORDER BY f.created_at DESC
            "#,
        )
        .bind(owner_id)
        .bind(folder_id)
        .bind(folder_id)
        .fetch_all(db.pool())
        .await?;

        Ok(rows.into_iter().map(FileListItem::from).collect())
    }

    /// Read the current content and count the download
    pub async fn download(state: &AppState, file_id: &str, actor: &str) -> Result<(File, Bytes)> {
        let file = Self::get_owned_file(&state.db, file_id, actor).await?;
        if file.trashed {
            return Err(AppError::NotFound("File is in trash".to_string()));
        }

        let blob = BlobStore::get_blob(&state.db, &file.blob_id)
            .await
            .map_err(|e| match e {
                AppError::NotFound(_) => AppError::integrity(format!(
                    "File {} references missing blob {}",
                    file.id, file.blob_id
                )),
                other => other,
            })?;
        let data = state.blobs.read(&blob).await?;

        sqlx::query("UPDATE files SET download_count = download_count + 1 WHERE id = ?")
            .bind(&file.id)
            .execute(state.db.pool())
            .await?;

        Ok((file, data))
    }

    /// Replace a file's tag set
    pub async fn update_tags(
        state: &AppState,
        file_id: &str,
        actor: &str,
        tags: &[String],
    ) -> Result<FileResponse> {
        let file = Self::get_owned_file(&state.db, file_id, actor).await?;
        let tags = Self::normalize_tags(&state.config.upload, tags)?;

        sqlx::query("UPDATE files SET tags = ?, updated_at = ? WHERE id = ?")
            .bind(Self::encode_tags(&tags)?)
            .bind(Utc::now().to_rfc3339())
            .bind(&file.id)
            .execute(state.db.pool())
            .await?;

        state.emit(
            actor,
            DomainEvent::FileTagsUpdated {
                file_id: file.id.clone(),
                owner_id: file.owner_id.clone(),
                tags,
            },
        );

        let file = Self::get_file(&state.db, &file.id).await?;
        Ok(FileResponse::from(file))
    }

    /// Reject empty or overlong names, path separators, traversal sequences
    /// and control characters
    pub fn validate_name(config: &UploadConfig, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(AppError::Validation("File name cannot be empty".to_string()));
        }
        if name.chars().count() > config.max_name_length {
            return Err(AppError::Validation(format!(
                "File name exceeds {} characters",
                config.max_name_length
            )));
        }
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(AppError::Validation("Invalid file name".to_string()));
        }
        if name.chars().any(char::is_control) {
            return Err(AppError::Validation(
                "File name contains control characters".to_string(),
            ));
        }
        Ok(())
    }

    /// Trim, bound and deduplicate tags, keeping first-seen order
    pub fn normalize_tags(config: &UploadConfig, tags: &[String]) -> Result<Vec<String>> {
        let mut normalized: Vec<String> = Vec::with_capacity(tags.len());

        for tag in tags {
            let tag = tag.trim();
            if tag.is_empty() {
                return Err(AppError::Validation("Tags cannot be empty".to_string()));
            }
            if tag.chars().count() > config.max_tag_length {
                return Err(AppError::Validation(format!(
                    "Tag exceeds {} characters",
                    config.max_tag_length
                )));
            }
            if !normalized.iter().any(|t| t == tag) {
                normalized.push(tag.to_string());
            }
        }

        if normalized.len() > config.max_tags {
            return Err(AppError::Validation(format!(
                "At most {} tags allowed",
                config.max_tags
            )));
        }

        Ok(normalized)
    }

    fn encode_tags(tags: &[String]) -> Result<String> {
        serde_json::to_string(tags).map_err(|e| AppError::Internal(format!("Failed to encode tags: {}", e)))
    }
}
