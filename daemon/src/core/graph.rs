//! In-memory dependency graph for one calendar day.
//!
//! The builder loads every node plus the edges active on the requested date
//! and freezes them into an arena-indexed value: nodes live in a `Vec`, a
//! `u32` index addresses them, and adjacency is a vector of edge positions
//! per node. The graph also carries its own topological order (the builder
//! rejects cyclic data outright) and a content hash that is stable across
//! fetch orders.

use std::collections::HashMap;

use chrono::NaiveDate;
use costwise_common::model::{CostNode, EdgeStrategyOverride, NodeType};
use serde_json::Value;
use sha3::{Digest, Sha3_256};
use uuid::Uuid;

use super::{
    error::AllocationError,
    ordering,
    storage::{NodeFilter, Storage},
};

pub type NodeIndex = u32;

/// One allocation edge, rebased onto arena indices. Strategy overrides ride
/// along so the resolver never goes back to the repository mid-day.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub id: Uuid,
    pub parent: NodeIndex,
    pub child: NodeIndex,
    pub default_strategy: String,
    pub default_parameters: Value,
    pub overrides: Vec<EdgeStrategyOverride>,
}

/// An edge whose endpoint row is missing from the node table. The graph
/// excludes it; `graph validate` reports it.
#[derive(Debug, Clone)]
pub struct DanglingEdge {
    pub edge_id: Uuid,
    pub missing_node: Uuid,
}

pub struct CostGraph {
    date: NaiveDate,
    nodes: Vec<CostNode>,
    index_by_id: HashMap<Uuid, NodeIndex>,
    edges: Vec<GraphEdge>,
    // node index -> positions into `edges`, repository natural order
    outgoing: Vec<Vec<usize>>,
    topological_order: Vec<NodeIndex>,
    dangling: Vec<DanglingEdge>,
    hash: String,
}

impl CostGraph {
    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> &[CostNode] {
        &self.nodes
    }

    pub fn node(&self, index: NodeIndex) -> &CostNode {
        &self.nodes[index as usize]
    }

    pub fn node_index(&self, id: &Uuid) -> Option<NodeIndex> {
        self.index_by_id.get(id).copied()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Outgoing edges of a node in the repository's stable order. The order
    /// only makes iteration deterministic, it carries no semantics.
    pub fn edges_from(&self, index: NodeIndex) -> impl Iterator<Item = &GraphEdge> {
        self.outgoing[index as usize]
            .iter()
            .map(move |&position| &self.edges[position])
    }

    /// Children of a node, one entry per outgoing edge.
    pub fn children_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.edges_from(index).map(|edge| edge.child).collect()
    }

    /// Parents before children, ties broken by node id.
    pub fn topological_order(&self) -> &[NodeIndex] {
        &self.topological_order
    }

    pub fn dangling_edges(&self) -> &[DanglingEdge] {
        &self.dangling
    }

    /// Stable content hash over nodes, edges and their strategy
    /// configuration; recorded on the computation run for auditability.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Product nodes with no outgoing product-to-product edge: the terminal
    /// destinations of cost.
    pub fn get_final_cost_centres(&self) -> Vec<NodeIndex> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(position, node)| {
                node.node_type == NodeType::Product
                    && !self.outgoing[*position].iter().any(|&edge_position| {
                        let child = self.edges[edge_position].child;
                        self.nodes[child as usize].node_type == NodeType::Product
                    })
            })
            .map(|(position, _)| position as NodeIndex)
            .collect()
    }
}

/// Load the graph active on `date`. Archived nodes are included: archival
/// is a presentation hint and must not silently drop allocations.
pub async fn build_graph<S: Storage>(
    storage: &S,
    date: NaiveDate,
) -> Result<CostGraph, AllocationError> {
    debug!("building dependency graph for {}", date);

    let nodes = storage.get_nodes(NodeFilter::default()).await?;
    let raw_edges = storage.get_edges_active_on(date).await?;
    let edge_ids: Vec<Uuid> = raw_edges.iter().map(|edge| edge.id).collect();
    let overrides = storage.get_strategy_overrides(&edge_ids).await?;

    let mut overrides_by_edge: HashMap<Uuid, Vec<EdgeStrategyOverride>> = HashMap::new();
    for entry in overrides {
        overrides_by_edge.entry(entry.edge_id).or_default().push(entry);
    }

    let mut index_by_id = HashMap::with_capacity(nodes.len());
    for (position, node) in nodes.iter().enumerate() {
        index_by_id.insert(node.id, position as NodeIndex);
    }

    let mut edges = Vec::with_capacity(raw_edges.len());
    let mut outgoing = vec![Vec::new(); nodes.len()];
    let mut dangling = Vec::new();
    for raw in raw_edges {
        let parent = index_by_id.get(&raw.parent_id).copied();
        let child = index_by_id.get(&raw.child_id).copied();
        let (Some(parent), Some(child)) = (parent, child) else {
            for missing in [raw.parent_id, raw.child_id] {
                if !index_by_id.contains_key(&missing) {
                    warn!("edge {} references missing node {}", raw.id, missing);
                    dangling.push(DanglingEdge {
                        edge_id: raw.id,
                        missing_node: missing,
                    });
                }
            }
            continue;
        };

        outgoing[parent as usize].push(edges.len());
        edges.push(GraphEdge {
            id: raw.id,
            parent,
            child,
            default_strategy: raw.default_strategy,
            default_parameters: raw.default_parameters,
            overrides: overrides_by_edge.remove(&raw.id).unwrap_or_default(),
        });
    }

    let topological_order = ordering::sort_topological(&nodes, &edges, &outgoing)?;
    let hash = content_hash(&nodes, &edges);

    trace!(
        "graph for {}: {} nodes, {} edges, hash {}",
        date,
        nodes.len(),
        edges.len(),
        hash
    );

    Ok(CostGraph {
        date,
        nodes,
        index_by_id,
        edges,
        outgoing,
        topological_order,
        dangling,
        hash,
    })
}

// Canonical digest: nodes sorted by id, then edges sorted by id with their
// strategy configuration. serde_json keeps object keys sorted, so the
// parameter serialization is already canonical.
fn content_hash(nodes: &[CostNode], edges: &[GraphEdge]) -> String {
    let mut hasher = Sha3_256::new();

    let mut node_order: Vec<usize> = (0..nodes.len()).collect();
    node_order.sort_by_key(|&position| nodes[position].id);
    for position in node_order {
        let node = &nodes[position];
        hasher.update(node.id.as_bytes());
        hasher.update(node.node_type.to_string().as_bytes());
        hasher.update([node.is_platform as u8]);
    }

    let mut edge_order: Vec<usize> = (0..edges.len()).collect();
    edge_order.sort_by_key(|&position| edges[position].id);
    for position in edge_order {
        let edge = &edges[position];
        hasher.update(edge.id.as_bytes());
        hasher.update(nodes[edge.parent as usize].id.as_bytes());
        hasher.update(nodes[edge.child as usize].id.as_bytes());
        hasher.update(edge.default_strategy.as_bytes());
        hasher.update(canonical_json(&edge.default_parameters).as_bytes());

        let mut override_order: Vec<usize> = (0..edge.overrides.len()).collect();
        override_order.sort_by_key(|&ov| edge.overrides[ov].dimension.clone());
        for ov in override_order {
            let entry = &edge.overrides[ov];
            hasher.update(entry.dimension.as_deref().unwrap_or("").as_bytes());
            hasher.update(entry.strategy.as_bytes());
            hasher.update(canonical_json(&entry.parameters).as_bytes());
        }
    }

    hex::encode(hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::MemoryStorage;
    use chrono::Utc;
    use costwise_common::model::DependencyEdge;
    use indexmap::IndexMap;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn create_test_node(id_byte: u8, node_type: NodeType) -> CostNode {
        let mut bytes = [0u8; 16];
        bytes[15] = id_byte;
        CostNode {
            id: Uuid::from_bytes(bytes),
            name: format!("node-{}", id_byte),
            node_type,
            is_platform: false,
            cost_labels: IndexMap::new(),
            metadata: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            archived_at: None,
        }
    }

    fn create_test_edge(parent: &CostNode, child: &CostNode, from: &str) -> DependencyEdge {
        DependencyEdge {
            id: Uuid::new_v4(),
            parent_id: parent.id,
            child_id: child.id,
            default_strategy: "equal".to_string(),
            default_parameters: Value::Null,
            active_from: date(from),
            active_to: None,
        }
    }

    #[tokio::test]
    async fn test_build_restricts_to_active_edges() {
        let platform = create_test_node(1, NodeType::Platform);
        let product = create_test_node(2, NodeType::Product);
        let mut expired = create_test_edge(&platform, &product, "2024-01-01");
        expired.active_to = Some(date("2024-02-01"));
        let storage = MemoryStorage::new();
        storage
            .seed_graph(vec![platform, product], vec![expired], Vec::new())
            .await;

        let on_time = build_graph(&storage, date("2024-01-15")).await.unwrap();
        assert_eq!(on_time.edge_count(), 1);

        // half-open interval: the edge is gone on its active_to date
        let after = build_graph(&storage, date("2024-02-01")).await.unwrap();
        assert_eq!(after.edge_count(), 0);
        assert_eq!(after.node_count(), 2);
    }

    #[tokio::test]
    async fn test_hash_ignores_fetch_order() {
        let a = create_test_node(1, NodeType::Platform);
        let b = create_test_node(2, NodeType::Product);
        let c = create_test_node(3, NodeType::Product);
        let e1 = create_test_edge(&a, &b, "2024-01-01");
        let e2 = create_test_edge(&a, &c, "2024-01-01");

        let forward = MemoryStorage::new();
        forward
            .seed_graph(
                vec![a.clone(), b.clone(), c.clone()],
                vec![e1.clone(), e2.clone()],
                Vec::new(),
            )
            .await;
        let backward = MemoryStorage::new();
        backward
            .seed_graph(vec![c, b, a], vec![e2, e1], Vec::new())
            .await;

        let g1 = build_graph(&forward, date("2024-06-01")).await.unwrap();
        let g2 = build_graph(&backward, date("2024-06-01")).await.unwrap();
        assert_eq!(g1.hash(), g2.hash());
    }

    #[tokio::test]
    async fn test_hash_changes_with_strategy() {
        let a = create_test_node(1, NodeType::Platform);
        let b = create_test_node(2, NodeType::Product);
        let equal = create_test_edge(&a, &b, "2024-01-01");
        let mut proportional = equal.clone();
        proportional.default_strategy = "proportional_on".to_string();

        let s1 = MemoryStorage::new();
        s1.seed_graph(vec![a.clone(), b.clone()], vec![equal], Vec::new())
            .await;
        let s2 = MemoryStorage::new();
        s2.seed_graph(vec![a, b], vec![proportional], Vec::new()).await;

        let g1 = build_graph(&s1, date("2024-06-01")).await.unwrap();
        let g2 = build_graph(&s2, date("2024-06-01")).await.unwrap();
        assert_ne!(g1.hash(), g2.hash());
    }

    #[tokio::test]
    async fn test_dangling_edge_is_reported_not_fatal() {
        let platform = create_test_node(1, NodeType::Platform);
        let ghost = create_test_node(9, NodeType::Product);
        let edge = create_test_edge(&platform, &ghost, "2024-01-01");
        let storage = MemoryStorage::new();
        // ghost is referenced by the edge but never stored
        storage
            .seed_graph(vec![platform], vec![edge], Vec::new())
            .await;

        let graph = build_graph(&storage, date("2024-06-01")).await.unwrap();
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.dangling_edges().len(), 1);
        assert_eq!(graph.dangling_edges()[0].missing_node, ghost.id);
    }

    #[tokio::test]
    async fn test_cycle_rejected_at_build_time() {
        let a = create_test_node(1, NodeType::Shared);
        let b = create_test_node(2, NodeType::Shared);
        let forward = create_test_edge(&a, &b, "2024-01-01");
        let back = create_test_edge(&b, &a, "2024-01-01");
        let storage = MemoryStorage::new();
        storage
            .seed_graph(vec![a, b], vec![forward, back], Vec::new())
            .await;

        assert!(matches!(
            build_graph(&storage, date("2024-06-01")).await,
            Err(AllocationError::CycleDetected(_))
        ));
    }

    #[tokio::test]
    async fn test_final_cost_centres() {
        let platform = create_test_node(1, NodeType::Platform);
        let bundle = create_test_node(2, NodeType::Product);
        let retail = create_test_node(3, NodeType::Product);
        let edges = vec![
            create_test_edge(&platform, &bundle, "2024-01-01"),
            create_test_edge(&bundle, &retail, "2024-01-01"),
        ];
        let storage = MemoryStorage::new();
        storage
            .seed_graph(
                vec![platform, bundle, retail.clone()],
                edges,
                Vec::new(),
            )
            .await;

        let graph = build_graph(&storage, date("2024-06-01")).await.unwrap();
        let centres = graph.get_final_cost_centres();
        assert_eq!(centres.len(), 1);
        assert_eq!(graph.node(centres[0]).id, retail.id);
    }
}
