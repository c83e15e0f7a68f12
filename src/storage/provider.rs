use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

use crate::error::Result;

/// Addressable byte storage behind the blob store
#[async_trait]
pub trait ContentSink: Send + Sync {
    /// Move a fully staged local file under `locator`
    async fn put_file(&self, locator: &str, staged: &Path) -> Result<()>;

    /// Read the content stored under `locator`
    async fn get(&self, locator: &str) -> Result<Bytes>;

    /// Delete content; returns false when nothing was stored under `locator`
    async fn delete(&self, locator: &str) -> Result<bool>;

    /// Check if content exists
    async fn exists(&self, locator: &str) -> Result<bool>;

    /// Every locator currently holding content
    async fn list(&self) -> Result<Vec<String>>;

    /// Get the storage type name
    fn storage_type(&self) -> &'static str;
}

/// Sharded locator derived from a hex digest: `ab/cd/abcd…`
pub fn locator_for(digest: &str) -> String {
    if digest.len() < 4 {
        return digest.to_string();
    }
    format!("{}/{}/{}", &digest[0..2], &digest[2..4], digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_sharding() {
        let digest = "a3f2e1d4c5b6";
        assert_eq!(locator_for(digest), "a3/f2/a3f2e1d4c5b6");
        assert_eq!(locator_for("ab"), "ab");
    }
}
