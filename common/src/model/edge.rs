use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A directed allocation edge: cost flows from `parent_id` (the source) to
/// `child_id` (the receiver). The edge carries the default strategy used for
/// every dimension that has no override.
///
/// Invariants enforced by the datastore: parent != child, `active_to` (when
/// set) is strictly after `active_from`, and at most one edge exists per
/// (parent, child, active_from).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub id: Uuid,
    pub parent_id: Uuid,
    pub child_id: Uuid,
    pub default_strategy: String,
    #[serde(default)]
    pub default_parameters: Value,
    pub active_from: NaiveDate,
    #[serde(default)]
    pub active_to: Option<NaiveDate>,
}

impl DependencyEdge {
    // Half-open activity interval: [active_from, active_to)
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.active_from <= date && self.active_to.is_none_or(|to| to > date)
    }
}

/// Dimension-specific (or edge-wide, when `dimension` is null) strategy
/// override. At most one per (edge, dimension).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeStrategyOverride {
    pub id: Uuid,
    pub edge_id: Uuid,
    #[serde(default)]
    pub dimension: Option<String>,
    pub strategy: String,
    #[serde(default)]
    pub parameters: Value,
}
