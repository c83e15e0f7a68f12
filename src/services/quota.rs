use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{StorageStats, Usage};
use crate::services::locks::KeyedLocks;
use crate::services::mime::base_type;

/// Per-owner accounting of live bytes against a ceiling.
///
/// `admit` checks and reserves under a per-owner lock, so concurrent uploads
/// from one owner cannot both pass against the same snapshot of `used`.
pub struct QuotaLedger {
    default_ceiling: i64,
    owner_locks: KeyedLocks,
    reserved: DashMap<String, i64>,
}

/// Bytes held against an owner's ceiling until the upload commits or fails
#[must_use]
pub struct QuotaReservation<'a> {
    ledger: &'a QuotaLedger,
    owner_id: String,
    bytes: i64,
}

impl QuotaLedger {
    pub fn new(default_ceiling: i64) -> Self {
        Self {
            default_ceiling,
            owner_locks: KeyedLocks::new(),
            reserved: DashMap::new(),
        }
    }

    /// Reserve `incoming` bytes for `owner_id`, or fail with `QuotaExceeded`
    pub async fn admit(
        &self,
        db: &Database,
        owner_id: &str,
        incoming: i64,
    ) -> Result<QuotaReservation<'_>> {
        let _guard = self.owner_locks.lock(owner_id).await;

        let used = Self::used(db, owner_id).await?;
        let ceiling = self.ceiling(db, owner_id).await?;
        let reserved = self.reserved_bytes(owner_id);

        if ceiling > 0 && used + reserved + incoming > ceiling {
            tracing::warn!(
                "Quota denied for {}: {} used, {} reserved, {} incoming, {} allowed",
                owner_id,
                used,
                reserved,
                incoming,
                ceiling
            );
            return Err(AppError::QuotaExceeded {
                used: used + reserved,
                incoming,
                ceiling,
            });
        }

        *self.reserved.entry(owner_id.to_string()).or_insert(0) += incoming;

        Ok(QuotaReservation {
            ledger: self,
            owner_id: owner_id.to_string(),
            bytes: incoming,
        })
    }

    /// Bytes currently reserved by in-flight uploads
    pub fn reserved_bytes(&self, owner_id: &str) -> i64 {
        self.reserved.get(owner_id).map(|r| *r).unwrap_or(0)
    }

    /// Sum of blob sizes over the owner's non-trashed files
    pub async fn used(db: &Database, owner_id: &str) -> Result<i64> {
        let used: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(b.size), 0) FROM files f
            JOIN blobs b ON b.id = f.blob_id
            WHERE f.owner_id = ? AND f.trashed = 0
            "#,
        )
        .bind(owner_id)
        .fetch_one(db.pool())
        .await?;
        Ok(used)
    }

    /// Owner's ceiling in bytes, 0 = unlimited
    pub async fn ceiling(&self, db: &Database, owner_id: &str) -> Result<i64> {
        let ceiling: Option<i64> = sqlx::query_scalar("SELECT ceiling FROM quotas WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_optional(db.pool())
            .await?;
        Ok(ceiling.unwrap_or(self.default_ceiling))
    }

    pub async fn current_usage(&self, db: &Database, owner_id: &str) -> Result<Usage> {
        let used = Self::used(db, owner_id).await?;
        let ceiling = self.ceiling(db, owner_id).await?;
        Ok(Usage::new(used, ceiling))
    }

    /// Set the owner's ceiling in bytes
    pub async fn set_quota(&self, db: &Database, owner_id: &str, ceiling: i64) -> Result<Usage> {
        if ceiling < 0 {
            return Err(AppError::Validation("Quota ceiling cannot be negative".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO quotas (owner_id, ceiling, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(owner_id) DO UPDATE SET ceiling = excluded.ceiling, updated_at = excluded.updated_at
            "#,
        )
        .bind(owner_id)
        .bind(ceiling)
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await?;

        tracing::info!("Quota for {} set to {} bytes", owner_id, ceiling);
        self.current_usage(db, owner_id).await
    }

    pub async fn storage_stats(&self, db: &Database, owner_id: &str) -> Result<StorageStats> {
        let usage = self.current_usage(db, owner_id).await?;

        let trash_size: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(b.size), 0) FROM files f
            JOIN blobs b ON b.id = f.blob_id
            WHERE f.owner_id = ? AND f.trashed = 1
            "#,
        )
        .bind(owner_id)
        .fetch_one(db.pool())
        .await?;

        let by_mime: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT f.mime_type, SUM(b.size) FROM files f
            JOIN blobs b ON b.id = f.blob_id
            WHERE f.owner_id = ? AND f.trashed = 0
            GROUP BY f.mime_type
            "#,
        )
        .bind(owner_id)
        .fetch_all(db.pool())
        .await?;

        let mut breakdown = BTreeMap::new();
        for (mime, size) in by_mime {
            *breakdown.entry(base_type(&mime)).or_insert(0) += size;
        }

        // Physical bytes behind the owner's live files, each blob counted once
        let physical: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(size), 0) FROM blobs
            WHERE id IN (SELECT blob_id FROM files WHERE owner_id = ? AND trashed = 0)
            "#,
        )
        .bind(owner_id)
        .fetch_one(db.pool())
        .await?;

        Ok(StorageStats {
            savings: usage.used - physical,
            usage,
            trash_size,
            breakdown,
        })
    }
}

impl QuotaReservation<'_> {
    pub fn bytes(&self) -> i64 {
        self.bytes
    }
}

impl Drop for QuotaReservation<'_> {
    fn drop(&mut self) {
        let emptied = match self.ledger.reserved.get_mut(&self.owner_id) {
            Some(mut entry) => {
                *entry -= self.bytes;
                *entry <= 0
            }
            None => false,
        };
        if emptied {
            self.ledger
                .reserved
                .remove_if(&self.owner_id, |_, bytes| *bytes <= 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;

    #[tokio::test]
    async fn test_admit_against_ceiling() {
        let h = TestHarness::new().await;
        let quota = &h.state.quota;
        quota.set_quota(&h.state.db, "alice", 1000).await.unwrap();
        h.upload("alice", "existing.bin", &[7u8; 900]).await.unwrap();

        let denied = quota.admit(&h.state.db, "alice", 150).await;
        assert!(matches!(
            denied,
            Err(AppError::QuotaExceeded { used: 900, incoming: 150, ceiling: 1000 })
        ));

        h.upload("alice", "small.bin", &[8u8; 90]).await.unwrap();
        let usage = quota.current_usage(&h.state.db, "alice").await.unwrap();
        assert_eq!(usage.used, 990);
        assert_eq!(usage.percentage, 99);
    }

    #[tokio::test]
    async fn test_reservations_count_until_dropped() {
        let h = TestHarness::new().await;
        let quota = &h.state.quota;
        quota.set_quota(&h.state.db, "bob", 100).await.unwrap();

        let held = quota.admit(&h.state.db, "bob", 60).await.unwrap();
        assert_eq!(quota.reserved_bytes("bob"), 60);
        assert!(quota.admit(&h.state.db, "bob", 60).await.is_err());

        drop(held);
        assert_eq!(quota.reserved_bytes("bob"), 0);
        let again = quota.admit(&h.state.db, "bob", 60).await.unwrap();
        assert_eq!(again.bytes(), 60);
    }

    #[tokio::test]
    async fn test_zero_ceiling_is_unlimited() {
        let h = TestHarness::new().await;
        let quota = &h.state.quota;
        quota.set_quota(&h.state.db, "carol", 0).await.unwrap();

        assert!(quota.admit(&h.state.db, "carol", i64::MAX / 2).await.is_ok());
        assert!(quota.set_quota(&h.state.db, "carol", -1).await.is_err());
    }

    #[tokio::test]
    async fn test_storage_stats_breakdown_and_savings() {
        let h = TestHarness::new().await;
        h.upload("dave", "a.txt", b"same text").await.unwrap();
        h.upload("dave", "b.txt", b"same text").await.unwrap();
        h.upload("dave", "c.pdf", b"%PDF-1.4 tiny").await.unwrap();

        let stats = h.state.quota.storage_stats(&h.state.db, "dave").await.unwrap();

        assert_eq!(stats.usage.used, 9 + 9 + 13);
        assert_eq!(stats.breakdown.get("text/plain"), Some(&18));
        assert_eq!(stats.breakdown.get("application/pdf"), Some(&13));
        assert_eq!(stats.savings, 9);
        assert_eq!(stats.trash_size, 0);
    }
}
