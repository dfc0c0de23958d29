use async_trait::async_trait;
use chrono::NaiveDate;
use costwise_common::{
    amount::Amount,
    api::{
        CoverageSummary, DatedAmount, DatedUsage, LabelBreakdown, NodeCostSummary,
        Recommendation, TypeBreakdown,
    },
    model::{ComputationRun, NodeType},
};
use uuid::Uuid;

use crate::core::error::StorageError;

/// Read queries backing the HTTP API. Every query is bound to one explicit
/// run id — callers first resolve "the latest completed run overlapping the
/// date range" and never mix runs.
#[async_trait]
pub trait AggregationProvider {
    /// Most recent `completed` run whose window covers `[start, end]`,
    /// ties broken by creation time descending.
    async fn latest_completed_run(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<ComputationRun>, StorageError>;

    /// Per-node totals over the range, summed in the datastore, ordered by
    /// total descending (node id as tie-break). `node_type` narrows to one
    /// type; products list = `Some(NodeType::Product)`.
    async fn sum_costs_by_node(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
        node_type: Option<NodeType>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<NodeCostSummary>, StorageError>;

    /// Final-cost-centre total and raw infrastructure total over the range.
    async fn coverage(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<CoverageSummary, StorageError>;

    async fn costs_by_type(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TypeBreakdown>, StorageError>;

    /// Totals grouped by the values of one node label key; nodes without the
    /// label are excluded.
    async fn costs_by_label(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
        key: &str,
    ) -> Result<Vec<LabelBreakdown>, StorageError>;

    /// Per-day total (summed over dimensions) for one node.
    async fn node_cost_series(
        &self,
        run_id: &Uuid,
        node_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DatedAmount>, StorageError>;

    /// Per-day metric values for one node; raw usage is not run-scoped.
    async fn node_usage_series(
        &self,
        node_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DatedUsage>, StorageError>;

    /// Parents whose outgoing contributions fell short of their holistic
    /// cost by more than `tolerance`, ordered by residual descending.
    async fn unallocated_residuals(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
        tolerance: Amount,
    ) -> Result<Vec<Recommendation>, StorageError>;

    /// Non-product nodes with direct cost above `cost_floor` and no usage
    /// rows at all over the range.
    async fn idle_resources(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
        cost_floor: Amount,
    ) -> Result<Vec<Recommendation>, StorageError>;

    /// Cheap connectivity probe for the health endpoint.
    async fn ping(&self) -> Result<(), StorageError>;
}

/// Fold the two coverage totals into the API shape. The percentage is the
/// one value rounded here (half-even, report scale); the totals stay exact.
pub fn coverage_summary(final_total: Amount, infra_total: Amount) -> CoverageSummary {
    let coverage_percent = final_total
        .checked_div(infra_total)
        .map(|ratio| (ratio * Amount::ONE_HUNDRED).rounded(crate::config::REPORT_DECIMAL_PLACES))
        .unwrap_or(Amount::ZERO);
    CoverageSummary {
        final_centre_total: final_total,
        raw_infrastructure_total: infra_total,
        coverage_percent,
    }
}
