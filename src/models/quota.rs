use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Live usage against the owner's ceiling
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub used: i64,
    /// 0 means unlimited
    pub ceiling: i64,
    pub percentage: u8,
}

impl Usage {
    pub fn new(used: i64, ceiling: i64) -> Self {
        Self {
            used,
            ceiling,
            percentage: if ceiling > 0 {
                (used as f64 / ceiling as f64 * 100.0).round().min(255.0) as u8
            } else {
                0
            },
        }
    }
}

/// Storage statistics for one owner
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub usage: Usage,
    pub trash_size: i64,
    pub breakdown: BTreeMap<String, i64>,
    /// Logical bytes referenced minus physical bytes of the distinct blobs behind them
    pub savings: i64,
}

/// Set quota request
#[derive(Debug, Deserialize)]
pub struct SetQuotaRequest {
    pub ceiling: i64,
}
