use async_trait::async_trait;
use chrono::NaiveDate;
use costwise_common::model::DailyCost;

use crate::core::error::StorageError;

#[async_trait]
pub trait CostProvider {
    /// All cost records for one date, optionally restricted to a dimension
    /// set.
    async fn get_costs_for_date(
        &self,
        date: NaiveDate,
        dimensions: Option<&[String]>,
    ) -> Result<Vec<DailyCost>, StorageError>;

    /// Idempotent batched upsert keyed on (node, date, dimension). Callers
    /// are expected to chunk; implementations must additionally bound
    /// statement size themselves.
    async fn upsert_costs(&self, costs: &[DailyCost]) -> Result<(), StorageError>;
}
