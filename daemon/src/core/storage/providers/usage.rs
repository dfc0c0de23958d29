use async_trait::async_trait;
use chrono::NaiveDate;
use costwise_common::model::{DailyUsage, LabelFilter};

use crate::core::error::StorageError;

#[async_trait]
pub trait UsageProvider {
    /// Usage rows over `[start, end]` inclusive, optionally restricted to a
    /// metric set and to rows whose labels satisfy every filter.
    async fn get_usage_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        metrics: Option<&[String]>,
        filters: &[LabelFilter],
    ) -> Result<Vec<DailyUsage>, StorageError>;

    /// Idempotent batched upsert keyed on (node, date, metric).
    async fn upsert_usage(&self, usage: &[DailyUsage]) -> Result<(), StorageError>;
}
