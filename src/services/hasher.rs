use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{AppError, Result};

const CHUNK_SIZE: usize = 64 * 1024;

/// Streams content once, hashing it while spooling it to a staging file
#[derive(Debug, Clone)]
pub struct ContentHasher {
    staging_dir: PathBuf,
    max_size: u64,
}

/// Hashed content waiting on local disk; the spool file is removed on drop
/// unless it was moved away first.
#[derive(Debug)]
pub struct StagedContent {
    pub digest: String,
    pub size: i64,
    path: PathBuf,
}

impl ContentHasher {
    pub fn new(staging_dir: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            max_size,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Consume `reader` to the end, producing its SHA-256 digest and length.
    ///
    /// Fails with `Validation` when the stream exceeds the maximum upload size
    /// and with `Io` when reading or spooling fails. Either way nothing is
    /// left in the staging area.
    pub async fn stage<R>(&self, mut reader: R) -> Result<StagedContent>
    where
        R: AsyncRead + Unpin,
    {
        fs::create_dir_all(&self.staging_dir).await?;

        let path = self.staging_dir.join(Uuid::new_v4().to_string());
        let mut staged = StagedContent {
            digest: String::new(),
            size: 0,
            path,
        };

        let mut file = fs::File::create(&staged.path).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total: u64 = 0;

        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if total > self.max_size {
                return Err(AppError::Validation(format!(
                    "File exceeds maximum upload size of {} bytes",
                    self.max_size
                )));
            }
            hasher.update(&buffer[..n]);
            file.write_all(&buffer[..n]).await?;
        }

        file.flush().await?;
        file.sync_all().await?;

        staged.digest = hex::encode(hasher.finalize());
        staged.size = total as i64;
        Ok(staged)
    }
}

impl StagedContent {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the staged bytes
    pub async fn open(&self) -> Result<fs::File> {
        Ok(fs::File::open(&self.path).await?)
    }
}

impl Drop for StagedContent {
    fn drop(&mut self) {
        // Already promoted into the content sink or never created
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Discarded staged content {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove staged content {:?}: {}", self.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_digest_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let hasher = ContentHasher::new(dir.path(), 1024);

        let staged = hasher.stage(&b"hello world"[..]).await.unwrap();

        assert_eq!(
            staged.digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(staged.size, 11);

        let mut reread = Vec::new();
        staged.open().await.unwrap().read_to_end(&mut reread).await.unwrap();
        assert_eq!(reread, b"hello world");

        let path = staged.path().to_path_buf();
        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stage_rejects_oversized_stream() {
        let dir = tempfile::tempdir().unwrap();
        let hasher = ContentHasher::new(dir.path(), 4);

        let result = hasher.stage(&b"too large"[..]).await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_stage_empty_stream() {
        let dir = tempfile::tempdir().unwrap();
        let hasher = ContentHasher::new(dir.path(), 4);

        let staged = hasher.stage(tokio::io::empty()).await.unwrap();

        assert_eq!(staged.size, 0);
        assert_eq!(
            staged.digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
