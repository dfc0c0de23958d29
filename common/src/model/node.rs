use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Business classification of a cost-bearing node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeType {
    Product,
    Resource,
    Platform,
    Shared,
    Infrastructure,
}

impl NodeType {
    // Everything except products counts toward raw infrastructure cost
    pub fn is_infrastructure_like(&self) -> bool {
        !matches!(self, NodeType::Product)
    }
}

/// A cost-bearing entity: a leaf resource, a shared service, a platform or a
/// business-facing product. Nodes are shared across computation runs and are
/// soft-deleted only (`archived_at`), never physically removed while an edge
/// or result row references them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostNode {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub is_platform: bool,
    #[serde(default)]
    pub cost_labels: IndexMap<String, String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl CostNode {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Whether this node's direct cost counts as raw infrastructure cost.
    /// The `is_platform` flag is orthogonal to the type: a product that is
    /// also a platform service is infrastructure-like.
    pub fn is_infrastructure_like(&self) -> bool {
        self.node_type.is_infrastructure_like() || self.is_platform
    }
}
