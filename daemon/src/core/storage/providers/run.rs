use async_trait::async_trait;
use chrono::NaiveDate;
use costwise_common::model::{AllocationResult, ComputationRun, ContributionResult, RunStatus};
use uuid::Uuid;

use crate::core::error::StorageError;

#[async_trait]
pub trait RunProvider {
    /// Create a new run in `pending` state.
    async fn create_run(
        &self,
        window_start: NaiveDate,
        window_end: NaiveDate,
        notes: Option<String>,
    ) -> Result<ComputationRun, StorageError>;

    async fn get_run(&self, run_id: &Uuid) -> Result<ComputationRun, StorageError>;

    async fn list_runs(&self, limit: i64) -> Result<Vec<ComputationRun>, StorageError>;

    /// Update status, replacing notes when provided. Terminal states are
    /// enforced by the engine, not here.
    async fn set_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        notes: Option<String>,
    ) -> Result<(), StorageError>;

    async fn set_run_graph_hash(
        &self,
        run_id: &Uuid,
        graph_hash: &str,
    ) -> Result<(), StorageError>;

    /// Insert one batch of allocation rows; the caller chunks at the
    /// configured batch size.
    async fn insert_allocation_results(
        &self,
        rows: &[AllocationResult],
    ) -> Result<(), StorageError>;

    /// Insert one batch of contribution rows; the caller chunks.
    async fn insert_contribution_results(
        &self,
        rows: &[ContributionResult],
    ) -> Result<(), StorageError>;

    /// Delete a run; its result rows cascade with it.
    async fn delete_run(&self, run_id: &Uuid) -> Result<(), StorageError>;
}
