use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{AppError, Result};
use crate::storage::ContentSink;

/// Local file system content sink
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn get_full_path(&self, locator: &str) -> PathBuf {
        self.base_path.join(locator)
    }

    /// Remove now-empty shard directories up to the base path
    async fn prune_empty_parents(&self, full_path: &Path) -> Result<()> {
        let mut current_dir = full_path.parent().map(|p| p.to_path_buf());
        while let Some(dir) = current_dir {
            if dir == self.base_path {
                break;
            }
            match fs::read_dir(&dir).await {
                Ok(mut entries) => {
                    if entries.next_entry().await?.is_some() {
                        break; // Not empty
                    }
                    let _ = fs::remove_dir(&dir).await;
                }
                Err(_) => break,
            }
            current_dir = dir.parent().map(|p| p.to_path_buf());
        }
        Ok(())
    }
}

#[async_trait]
impl ContentSink for LocalStorage {
    async fn put_file(&self, locator: &str, staged: &Path) -> Result<()> {
        let full_path = self.get_full_path(locator);

        // Ensure parent directory exists
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Rename is atomic on the same filesystem; otherwise copy through a
        // sibling temp file so the locator never holds partial content.
        if let Err(e) = fs::rename(staged, &full_path).await {
            tracing::debug!("Rename of {:?} failed ({}), copying instead", staged, e);
            let partial = full_path.with_extension("partial");
            fs::copy(staged, &partial).await?;
            fs::rename(&partial, &full_path).await?;
        }

        tracing::debug!("Stored content at {:?}", full_path);
        Ok(())
    }

    async fn get(&self, locator: &str) -> Result<Bytes> {
        let full_path = self.get_full_path(locator);

        let data = fs::read(&full_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(format!("Content not found: {}", locator))
            } else {
                AppError::Storage(format!("Failed to read content: {}", e))
            }
        })?;

        Ok(Bytes::from(data))
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        let full_path = self.get_full_path(locator);

        match fs::remove_file(&full_path).await {
            Ok(()) => {
                tracing::debug!("Deleted content {:?}", full_path);
                self.prune_empty_parents(&full_path).await?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AppError::Storage(format!(
                "Failed to delete content {}: {}",
                locator, e
            ))),
        }
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        Ok(fs::try_exists(self.get_full_path(locator)).await?)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut locators = Vec::new();
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                // Skip the staging area and other hidden bookkeeping
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.base_path) {
                    let locator = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    locators.push(locator);
                }
            }
        }

        Ok(locators)
    }

    fn storage_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("blobs"));

        let staged = dir.path().join("staged");
        tokio::fs::write(&staged, b"hello").await.unwrap();

        storage.put_file("ab/cd/abcd", &staged).await.unwrap();
        assert!(storage.exists("ab/cd/abcd").await.unwrap());
        assert!(!staged.exists());
        assert_eq!(storage.get("ab/cd/abcd").await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(storage.list().await.unwrap(), vec!["ab/cd/abcd".to_string()]);

        assert!(storage.delete("ab/cd/abcd").await.unwrap());
        assert!(!storage.exists("ab/cd/abcd").await.unwrap());
        // Shard directories are pruned with the last file
        assert!(!dir.path().join("blobs/ab").exists());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        assert!(!storage.delete("ff/ee/ffee").await.unwrap());
        assert!(matches!(
            storage.get("ff/ee/ffee").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_skips_hidden_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        tokio::fs::create_dir_all(dir.path().join(".staging")).await.unwrap();
        tokio::fs::write(dir.path().join(".staging/upload"), b"x").await.unwrap();

        assert!(storage.list().await.unwrap().is_empty());
    }
}
