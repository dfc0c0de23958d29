//! Topological ordering of the dependency graph.
//!
//! Standard Kahn iteration with the ready set kept in a heap keyed by node
//! id, so two builds of the same graph produce the same order regardless of
//! the fetch order of the rows. Parents always appear before children: when
//! the engine reaches a node, every inflow from its ancestors is final.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use costwise_common::model::CostNode;
use uuid::Uuid;

use super::{
    error::{AllocationError, CyclePath},
    graph::{GraphEdge, NodeIndex},
};

pub fn sort_topological(
    nodes: &[CostNode],
    edges: &[GraphEdge],
    outgoing: &[Vec<usize>],
) -> Result<Vec<NodeIndex>, AllocationError> {
    trace!("topological sort over {} nodes, {} edges", nodes.len(), edges.len());

    let mut in_degree = vec![0u32; nodes.len()];
    for edge in edges {
        in_degree[edge.child as usize] += 1;
    }

    let mut ready: BinaryHeap<Reverse<(Uuid, NodeIndex)>> = nodes
        .iter()
        .enumerate()
        .filter(|(position, _)| in_degree[*position] == 0)
        .map(|(position, node)| Reverse((node.id, position as NodeIndex)))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    let mut processed = vec![false; nodes.len()];
    while let Some(Reverse((_, index))) = ready.pop() {
        order.push(index);
        processed[index as usize] = true;
        for &edge_position in &outgoing[index as usize] {
            let child = edges[edge_position].child;
            in_degree[child as usize] -= 1;
            if in_degree[child as usize] == 0 {
                ready.push(Reverse((nodes[child as usize].id, child)));
            }
        }
    }

    if order.len() < nodes.len() {
        let witness = find_witness_cycle(nodes, edges, &processed);
        return Err(AllocationError::CycleDetected(witness));
    }

    Ok(order)
}

// Every unprocessed node kept at least one unprocessed parent, so walking
// parent links inside the unprocessed set must revisit a node; the segment
// between the two visits is a cycle.
fn find_witness_cycle(nodes: &[CostNode], edges: &[GraphEdge], processed: &[bool]) -> CyclePath {
    let Some(start) = (0..nodes.len()).position(|index| !processed[index]) else {
        return CyclePath(Vec::new());
    };

    let mut path: Vec<NodeIndex> = vec![start as NodeIndex];
    let mut first_seen_at: HashMap<NodeIndex, usize> = HashMap::new();
    first_seen_at.insert(start as NodeIndex, 0);

    loop {
        let current = *path.last().unwrap_or(&(start as NodeIndex));
        let Some(parent) = edges
            .iter()
            .find(|edge| edge.child == current && !processed[edge.parent as usize])
            .map(|edge| edge.parent)
        else {
            return CyclePath(Vec::new());
        };

        if let Some(&position) = first_seen_at.get(&parent) {
            // Walked backwards, so the reversed segment reads in edge
            // direction; the entry node is repeated to close the loop.
            let mut ids: Vec<Uuid> = vec![nodes[parent as usize].id];
            ids.extend(
                path[position..]
                    .iter()
                    .rev()
                    .map(|&index| nodes[index as usize].id),
            );
            return CyclePath(ids);
        }

        first_seen_at.insert(parent, path.len());
        path.push(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use costwise_common::model::NodeType;
    use indexmap::IndexMap;
    use serde_json::Value;

    fn create_test_node(id_byte: u8) -> CostNode {
        let mut bytes = [0u8; 16];
        bytes[15] = id_byte;
        CostNode {
            id: Uuid::from_bytes(bytes),
            name: format!("node-{}", id_byte),
            node_type: NodeType::Resource,
            is_platform: false,
            cost_labels: IndexMap::new(),
            metadata: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            archived_at: None,
        }
    }

    fn create_test_edge(parent: NodeIndex, child: NodeIndex) -> GraphEdge {
        GraphEdge {
            id: Uuid::new_v4(),
            parent,
            child,
            default_strategy: "equal".to_string(),
            default_parameters: Value::Null,
            overrides: Vec::new(),
        }
    }

    fn outgoing_of(node_count: usize, edges: &[GraphEdge]) -> Vec<Vec<usize>> {
        let mut outgoing = vec![Vec::new(); node_count];
        for (position, edge) in edges.iter().enumerate() {
            outgoing[edge.parent as usize].push(position);
        }
        outgoing
    }

    #[test]
    fn test_chain_orders_parents_first() {
        let nodes = vec![create_test_node(3), create_test_node(1), create_test_node(2)];
        // 0 -> 1 -> 2
        let edges = vec![create_test_edge(0, 1), create_test_edge(1, 2)];
        let outgoing = outgoing_of(nodes.len(), &edges);

        let order = sort_topological(&nodes, &edges, &outgoing).unwrap();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_ties_break_by_node_id() {
        // three roots, no edges: order must follow the ids, not the indices
        let nodes = vec![create_test_node(9), create_test_node(4), create_test_node(7)];
        let edges = Vec::new();
        let outgoing = outgoing_of(nodes.len(), &edges);

        let order = sort_topological(&nodes, &edges, &outgoing).unwrap();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_diamond_junction_comes_last() {
        // 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3
        let nodes = (1..=4).map(create_test_node).collect::<Vec<_>>();
        let edges = vec![
            create_test_edge(0, 1),
            create_test_edge(0, 2),
            create_test_edge(1, 3),
            create_test_edge(2, 3),
        ];
        let outgoing = outgoing_of(nodes.len(), &edges);

        let order = sort_topological(&nodes, &edges, &outgoing).unwrap();
        assert_eq!(order[0], 0);
        assert_eq!(order[3], 3);
    }

    #[test]
    fn test_cycle_is_detected_with_witness() {
        // 0 -> 1 -> 2 -> 0
        let nodes = (1..=3).map(create_test_node).collect::<Vec<_>>();
        let edges = vec![
            create_test_edge(0, 1),
            create_test_edge(1, 2),
            create_test_edge(2, 0),
        ];
        let outgoing = outgoing_of(nodes.len(), &edges);

        match sort_topological(&nodes, &edges, &outgoing) {
            Err(AllocationError::CycleDetected(CyclePath(ids))) => {
                // the witness closes on itself and names every member
                assert_eq!(ids.first(), ids.last());
                assert_eq!(ids.len(), 4);
            }
            other => panic!("expected cycle, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let nodes = vec![create_test_node(1)];
        let edges = vec![create_test_edge(0, 0)];
        let outgoing = outgoing_of(nodes.len(), &edges);

        assert!(matches!(
            sort_topological(&nodes, &edges, &outgoing),
            Err(AllocationError::CycleDetected(_))
        ));
    }
}
