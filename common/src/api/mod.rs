//! Request and response types of the HTTP read API.
//!
//! Monetary values serialize as decimal strings through [`Amount`]; dates
//! are ISO 8601 calendar days. These types are shared between the server
//! and any Rust-side consumers.

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{amount::Amount, model::NodeType};

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProductsParams {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub currency: String,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodesParams {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub currency: String,
    /// Optional node type filter, parsed server-side so an unknown value can
    /// be answered with a 400 instead of a deserialization failure.
    #[serde(rename = "type", default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RangeParams {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ByDimensionParams {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub currency: String,
    /// Node label key to group by.
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunsParams {
    #[serde(default)]
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCostSummary {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub is_platform: bool,
    pub total_amount: Amount,
}

/// Coverage = total attributed to final cost centres over raw infrastructure
/// cost, expected to be <= 100%.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub final_centre_total: Amount,
    pub raw_infrastructure_total: Amount,
    pub coverage_percent: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductsResponse {
    pub products: Vec<NodeCostSummary>,
    pub coverage: CoverageSummary,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeCostSummary>,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeBreakdown {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub total_amount: Amount,
    pub node_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostsByTypeResponse {
    pub types: Vec<TypeBreakdown>,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelBreakdown {
    pub value: String,
    pub total_amount: Amount,
    pub node_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostsByDimensionResponse {
    pub key: String,
    pub groups: Vec<LabelBreakdown>,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatedAmount {
    pub date: NaiveDate,
    pub total_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatedUsage {
    pub date: NaiveDate,
    pub metrics: IndexMap<String, Amount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetricsResponse {
    pub id: Uuid,
    pub name: String,
    pub costs: Vec<DatedAmount>,
    pub usage: Vec<DatedUsage>,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// A parent pushed less than its holistic cost to its children
    /// (capped or under-configured shares); the residual stays unattributed.
    UnallocatedResidual,
    /// A non-product node carries direct cost but recorded no usage at all
    /// over the range.
    IdleResource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub node_id: Uuid,
    pub node_name: String,
    pub amount: Amount,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationsResponse {
    pub recommendations: Vec<Recommendation>,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardResponse {
    pub top_products: Vec<NodeCostSummary>,
    pub platform_nodes: Vec<NodeCostSummary>,
    pub resource_nodes: Vec<NodeCostSummary>,
    pub shared_nodes: Vec<NodeCostSummary>,
    pub costs_by_type: Vec<TypeBreakdown>,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub database: String,
}

/// Error body shape shared by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_omits_empty_detail() {
        let body = ErrorBody {
            error: "not_found".to_string(),
            detail: None,
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            "{\"error\":\"not_found\"}"
        );
    }

    #[test]
    fn test_params_parse_from_query_string() {
        let params: ProductsParams = serde_urlencoded::from_str(
            "start_date=2024-01-01&end_date=2024-01-31&currency=USD&limit=10",
        )
        .unwrap();
        assert_eq!(params.start_date.to_string(), "2024-01-01");
        assert_eq!(params.limit, Some(10));
        assert_eq!(params.offset, None);
    }
}
