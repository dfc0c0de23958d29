use async_trait::async_trait;
use costwise_common::model::{CostNode, NodeType};
use uuid::Uuid;

use crate::core::error::StorageError;

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeFilter {
    pub node_type: Option<NodeType>,
    /// Archived nodes are included by default: archival is a UI hint, not a
    /// data gate, and archived nodes with active edges still allocate.
    pub exclude_archived: bool,
}

#[async_trait]
pub trait NodeProvider {
    async fn get_nodes(&self, filter: NodeFilter) -> Result<Vec<CostNode>, StorageError>;

    async fn get_node_by_id(&self, id: &Uuid) -> Result<CostNode, StorageError>;

    // Name lookup is an ingestion-boundary convenience, never used in the
    // allocation loop
    async fn get_node_by_name(&self, name: &str) -> Result<Option<CostNode>, StorageError>;
}
