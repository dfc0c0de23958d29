use async_trait::async_trait;
use chrono::NaiveDate;
use costwise_common::model::{DependencyEdge, EdgeStrategyOverride};
use uuid::Uuid;

use crate::core::error::StorageError;

#[async_trait]
pub trait EdgeProvider {
    /// Single scan over all edges active on `date` (half-open interval on
    /// `active_to`), in the repository's stable natural order:
    /// (parent_id, child_id, active_from).
    async fn get_edges_active_on(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<DependencyEdge>, StorageError>;

    /// All strategy overrides for the given edges, one scan.
    async fn get_strategy_overrides(
        &self,
        edge_ids: &[Uuid],
    ) -> Result<Vec<EdgeStrategyOverride>, StorageError>;
}
