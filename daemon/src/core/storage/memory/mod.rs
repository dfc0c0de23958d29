//! HashMap-backed storage.
//!
//! Backs the engine test-suite and the offline `graph validate` tooling,
//! where a JSON fixture stands in for the database. Aggregation queries
//! mirror the SQL backend's semantics so the two backends are
//! interchangeable behind [`Storage`].

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use costwise_common::{
    amount::Amount,
    api::{
        CoverageSummary, DatedAmount, DatedUsage, LabelBreakdown, NodeCostSummary,
        Recommendation, RecommendationKind, TypeBreakdown,
    },
    model::{
        AllocationResult, ComputationRun, ContributionResult, CostNode, DailyCost, DailyUsage,
        DependencyEdge, EdgeStrategyOverride, LabelFilter, NodeType, RunStatus,
    },
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    coverage_summary, AggregationProvider, CostProvider, EdgeProvider, NodeFilter, NodeProvider,
    RunProvider, Storage, UsageProvider,
};
use crate::core::error::StorageError;

#[derive(Default)]
struct Inner {
    nodes: Vec<CostNode>,
    edges: Vec<DependencyEdge>,
    overrides: Vec<EdgeStrategyOverride>,
    costs: BTreeMap<(NaiveDate, Uuid, String), DailyCost>,
    usage: BTreeMap<(NaiveDate, Uuid, String), DailyUsage>,
    runs: HashMap<Uuid, ComputationRun>,
    allocations: Vec<AllocationResult>,
    contributions: Vec<ContributionResult>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_graph(
        &self,
        nodes: Vec<CostNode>,
        edges: Vec<DependencyEdge>,
        overrides: Vec<EdgeStrategyOverride>,
    ) {
        let mut inner = self.inner.write().await;
        inner.nodes.extend(nodes);
        inner.edges.extend(edges);
        inner.overrides.extend(overrides);
    }

    pub async fn seed_costs(&self, costs: Vec<DailyCost>) {
        let mut inner = self.inner.write().await;
        for cost in costs {
            inner
                .costs
                .insert((cost.cost_date, cost.node_id, cost.dimension.clone()), cost);
        }
    }

    pub async fn seed_usage(&self, usage: Vec<DailyUsage>) {
        let mut inner = self.inner.write().await;
        for row in usage {
            inner
                .usage
                .insert((row.usage_date, row.node_id, row.metric.clone()), row);
        }
    }

    /// Raw allocation rows of one run, ordered by (date, node, dimension).
    pub async fn allocation_rows(&self, run_id: &Uuid) -> Vec<AllocationResult> {
        let inner = self.inner.read().await;
        let mut rows: Vec<AllocationResult> = inner
            .allocations
            .iter()
            .filter(|row| row.run_id == *run_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.allocation_date, a.node_id, &a.dimension).cmp(&(
                b.allocation_date,
                b.node_id,
                &b.dimension,
            ))
        });
        rows
    }

    /// Raw contribution rows of one run, ordered by (date, parent, child,
    /// dimension).
    pub async fn contribution_rows(&self, run_id: &Uuid) -> Vec<ContributionResult> {
        let inner = self.inner.read().await;
        let mut rows: Vec<ContributionResult> = inner
            .contributions
            .iter()
            .filter(|row| row.run_id == *run_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.contribution_date, a.parent_id, a.child_id, &a.dimension).cmp(&(
                b.contribution_date,
                b.parent_id,
                b.child_id,
                &b.dimension,
            ))
        });
        rows
    }
}

#[async_trait]
impl NodeProvider for MemoryStorage {
    async fn get_nodes(&self, filter: NodeFilter) -> Result<Vec<CostNode>, StorageError> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<CostNode> = inner
            .nodes
            .iter()
            .filter(|node| {
                filter
                    .node_type
                    .is_none_or(|wanted| node.node_type == wanted)
                    && !(filter.exclude_archived && node.is_archived())
            })
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(nodes)
    }

    async fn get_node_by_id(&self, id: &Uuid) -> Result<CostNode, StorageError> {
        let inner = self.inner.read().await;
        inner
            .nodes
            .iter()
            .find(|node| node.id == *id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("node {}", id)))
    }

    async fn get_node_by_name(&self, name: &str) -> Result<Option<CostNode>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.nodes.iter().find(|node| node.name == name).cloned())
    }
}

#[async_trait]
impl EdgeProvider for MemoryStorage {
    async fn get_edges_active_on(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<DependencyEdge>, StorageError> {
        let inner = self.inner.read().await;
        let mut edges: Vec<DependencyEdge> = inner
            .edges
            .iter()
            .filter(|edge| edge.is_active_on(date))
            .cloned()
            .collect();
        edges.sort_by(|a, b| {
            (a.parent_id, a.child_id, a.active_from).cmp(&(b.parent_id, b.child_id, b.active_from))
        });
        Ok(edges)
    }

    async fn get_strategy_overrides(
        &self,
        edge_ids: &[Uuid],
    ) -> Result<Vec<EdgeStrategyOverride>, StorageError> {
        let wanted: HashSet<&Uuid> = edge_ids.iter().collect();
        let inner = self.inner.read().await;
        Ok(inner
            .overrides
            .iter()
            .filter(|entry| wanted.contains(&entry.edge_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CostProvider for MemoryStorage {
    async fn get_costs_for_date(
        &self,
        date: NaiveDate,
        dimensions: Option<&[String]>,
    ) -> Result<Vec<DailyCost>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .costs
            .range((date, Uuid::nil(), String::new())..)
            .take_while(|((day, _, _), _)| *day == date)
            .filter(|((_, _, dimension), _)| {
                dimensions.is_none_or(|wanted| wanted.iter().any(|d| d == dimension))
            })
            .map(|(_, cost)| cost.clone())
            .collect())
    }

    async fn upsert_costs(&self, costs: &[DailyCost]) -> Result<(), StorageError> {
        for cost in costs {
            if cost.amount.sign() < 0 {
                return Err(StorageError::ConstraintViolation(format!(
                    "negative cost amount for node {}",
                    cost.node_id
                )));
            }
        }
        let mut inner = self.inner.write().await;
        for cost in costs {
            inner.costs.insert(
                (cost.cost_date, cost.node_id, cost.dimension.clone()),
                cost.clone(),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl UsageProvider for MemoryStorage {
    async fn get_usage_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        metrics: Option<&[String]>,
        filters: &[LabelFilter],
    ) -> Result<Vec<DailyUsage>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .usage
            .range((start, Uuid::nil(), String::new())..)
            .take_while(|((day, _, _), _)| *day <= end)
            .filter(|((_, _, metric), _)| {
                metrics.is_none_or(|wanted| wanted.iter().any(|m| m == metric))
            })
            .filter(|(_, row)| filters.iter().all(|filter| filter.matches(&row.labels)))
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn upsert_usage(&self, usage: &[DailyUsage]) -> Result<(), StorageError> {
        for row in usage {
            if row.value.sign() < 0 {
                return Err(StorageError::ConstraintViolation(format!(
                    "negative usage value for node {}",
                    row.node_id
                )));
            }
        }
        let mut inner = self.inner.write().await;
        for row in usage {
            inner.usage.insert(
                (row.usage_date, row.node_id, row.metric.clone()),
                row.clone(),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl RunProvider for MemoryStorage {
    async fn create_run(
        &self,
        window_start: NaiveDate,
        window_end: NaiveDate,
        notes: Option<String>,
    ) -> Result<ComputationRun, StorageError> {
        let now = Utc::now();
        let run = ComputationRun {
            id: Uuid::new_v4(),
            window_start,
            window_end,
            graph_hash: None,
            status: RunStatus::Pending,
            notes,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.write().await;
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<ComputationRun, StorageError> {
        let inner = self.inner.read().await;
        inner
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("run {}", run_id)))
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<ComputationRun>, StorageError> {
        let inner = self.inner.read().await;
        let mut runs: Vec<ComputationRun> = inner.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn set_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        notes: Option<String>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StorageError::NotFound(format!("run {}", run_id)))?;
        if run.status.is_terminal() {
            return Err(StorageError::ConstraintViolation(format!(
                "run {} is already {}",
                run_id, run.status
            )));
        }
        run.status = status;
        if notes.is_some() {
            run.notes = notes;
        }
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn set_run_graph_hash(
        &self,
        run_id: &Uuid,
        graph_hash: &str,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StorageError::NotFound(format!("run {}", run_id)))?;
        run.graph_hash = Some(graph_hash.to_string());
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_allocation_results(
        &self,
        rows: &[AllocationResult],
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let mut keys: HashSet<(Uuid, Uuid, NaiveDate, &str)> = inner
            .allocations
            .iter()
            .map(|row| {
                (
                    row.run_id,
                    row.node_id,
                    row.allocation_date,
                    row.dimension.as_str(),
                )
            })
            .collect();
        for row in rows {
            if row.direct_amount.sign() < 0
                || row.indirect_amount.sign() < 0
                || row.total_amount.sign() < 0
            {
                return Err(StorageError::ConstraintViolation(format!(
                    "negative allocation amount for node {}",
                    row.node_id
                )));
            }
            if !row.is_consistent() {
                return Err(StorageError::ConstraintViolation(format!(
                    "allocation total mismatch for node {}",
                    row.node_id
                )));
            }
            if !keys.insert((
                row.run_id,
                row.node_id,
                row.allocation_date,
                row.dimension.as_str(),
            )) {
                return Err(StorageError::ConstraintViolation(format!(
                    "duplicate allocation row for node {} on {}",
                    row.node_id, row.allocation_date
                )));
            }
        }
        drop(keys);
        inner.allocations.extend_from_slice(rows);
        Ok(())
    }

    async fn insert_contribution_results(
        &self,
        rows: &[ContributionResult],
    ) -> Result<(), StorageError> {
        for row in rows {
            if row.contributed_amount.sign() < 0 {
                return Err(StorageError::ConstraintViolation(format!(
                    "negative contribution from {} to {}",
                    row.parent_id, row.child_id
                )));
            }
            if row.parent_id == row.child_id {
                return Err(StorageError::ConstraintViolation(format!(
                    "self-contribution on node {}",
                    row.parent_id
                )));
            }
        }
        let mut inner = self.inner.write().await;
        inner.contributions.extend_from_slice(rows);
        Ok(())
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner
            .runs
            .remove(run_id)
            .ok_or_else(|| StorageError::NotFound(format!("run {}", run_id)))?;
        inner.allocations.retain(|row| row.run_id != *run_id);
        inner.contributions.retain(|row| row.run_id != *run_id);
        Ok(())
    }
}

#[async_trait]
impl AggregationProvider for MemoryStorage {
    async fn latest_completed_run(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<ComputationRun>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .runs
            .values()
            .filter(|run| {
                run.status == RunStatus::Completed
                    && run.window_start <= start
                    && run.window_end >= end
            })
            .max_by_key(|run| (run.created_at, run.id))
            .cloned())
    }

    async fn sum_costs_by_node(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
        node_type: Option<NodeType>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<NodeCostSummary>, StorageError> {
        let inner = self.inner.read().await;
        let mut totals: HashMap<Uuid, Amount> = HashMap::new();
        for row in rows_in_range(&inner.allocations, run_id, start, end) {
            *totals.entry(row.node_id).or_insert(Amount::ZERO) += row.total_amount;
        }

        let mut summaries: Vec<NodeCostSummary> = inner
            .nodes
            .iter()
            .filter(|node| node_type.is_none_or(|wanted| node.node_type == wanted))
            .filter_map(|node| {
                totals.get(&node.id).map(|total| NodeCostSummary {
                    id: node.id,
                    name: node.name.clone(),
                    node_type: node.node_type,
                    is_platform: node.is_platform,
                    total_amount: *total,
                })
            })
            .collect();
        summaries.sort_by(|a, b| b.total_amount.cmp(&a.total_amount).then(a.id.cmp(&b.id)));
        Ok(summaries
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn coverage(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<CoverageSummary, StorageError> {
        let inner = self.inner.read().await;
        let nodes_by_id: HashMap<Uuid, &CostNode> =
            inner.nodes.iter().map(|node| (node.id, node)).collect();

        // products that feed another product through an edge overlapping the
        // range are intermediate, not final cost centres
        let mut feeds_a_product: HashSet<Uuid> = HashSet::new();
        for edge in &inner.edges {
            let overlaps =
                edge.active_from <= end && edge.active_to.is_none_or(|to| to > start);
            if overlaps
                && nodes_by_id
                    .get(&edge.child_id)
                    .is_some_and(|child| child.node_type == NodeType::Product)
            {
                feeds_a_product.insert(edge.parent_id);
            }
        }

        let mut final_total = Amount::ZERO;
        let mut infra_total = Amount::ZERO;
        for row in rows_in_range(&inner.allocations, run_id, start, end) {
            let Some(node) = nodes_by_id.get(&row.node_id) else {
                continue;
            };
            if node.node_type == NodeType::Product && !feeds_a_product.contains(&node.id) {
                final_total += row.total_amount;
            }
            if node.is_infrastructure_like() {
                infra_total += row.direct_amount;
            }
        }

        Ok(coverage_summary(final_total, infra_total))
    }

    async fn costs_by_type(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TypeBreakdown>, StorageError> {
        let inner = self.inner.read().await;
        let nodes_by_id: HashMap<Uuid, &CostNode> =
            inner.nodes.iter().map(|node| (node.id, node)).collect();

        let mut totals: HashMap<NodeType, (Amount, HashSet<Uuid>)> = HashMap::new();
        for row in rows_in_range(&inner.allocations, run_id, start, end) {
            let Some(node) = nodes_by_id.get(&row.node_id) else {
                continue;
            };
            let entry = totals
                .entry(node.node_type)
                .or_insert((Amount::ZERO, HashSet::new()));
            entry.0 += row.total_amount;
            entry.1.insert(row.node_id);
        }

        let mut breakdown: Vec<TypeBreakdown> = totals
            .into_iter()
            .map(|(node_type, (total_amount, nodes))| TypeBreakdown {
                node_type,
                total_amount,
                node_count: nodes.len() as i64,
            })
            .collect();
        breakdown.sort_by(|a, b| b.total_amount.cmp(&a.total_amount));
        Ok(breakdown)
    }

    async fn costs_by_label(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
        key: &str,
    ) -> Result<Vec<LabelBreakdown>, StorageError> {
        let inner = self.inner.read().await;
        let label_of: HashMap<Uuid, &String> = inner
            .nodes
            .iter()
            .filter_map(|node| node.cost_labels.get(key).map(|value| (node.id, value)))
            .collect();

        let mut totals: BTreeMap<&String, (Amount, HashSet<Uuid>)> = BTreeMap::new();
        for row in rows_in_range(&inner.allocations, run_id, start, end) {
            let Some(&value) = label_of.get(&row.node_id) else {
                continue;
            };
            let entry = totals
                .entry(value)
                .or_insert((Amount::ZERO, HashSet::new()));
            entry.0 += row.total_amount;
            entry.1.insert(row.node_id);
        }

        let mut breakdown: Vec<LabelBreakdown> = totals
            .into_iter()
            .map(|(value, (total_amount, nodes))| LabelBreakdown {
                value: value.clone(),
                total_amount,
                node_count: nodes.len() as i64,
            })
            .collect();
        breakdown.sort_by(|a, b| b.total_amount.cmp(&a.total_amount).then(a.value.cmp(&b.value)));
        Ok(breakdown)
    }

    async fn node_cost_series(
        &self,
        run_id: &Uuid,
        node_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DatedAmount>, StorageError> {
        let inner = self.inner.read().await;
        let mut by_date: BTreeMap<NaiveDate, Amount> = BTreeMap::new();
        for row in rows_in_range(&inner.allocations, run_id, start, end) {
            if row.node_id == *node_id {
                *by_date.entry(row.allocation_date).or_insert(Amount::ZERO) += row.total_amount;
            }
        }
        Ok(by_date
            .into_iter()
            .map(|(date, total_amount)| DatedAmount { date, total_amount })
            .collect())
    }

    async fn node_usage_series(
        &self,
        node_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DatedUsage>, StorageError> {
        let inner = self.inner.read().await;
        let mut by_date: BTreeMap<NaiveDate, BTreeMap<String, Amount>> = BTreeMap::new();
        for ((date, node, metric), row) in inner.usage.range((start, Uuid::nil(), String::new())..)
        {
            if *date > end {
                break;
            }
            if node == node_id {
                by_date
                    .entry(*date)
                    .or_default()
                    .insert(metric.clone(), row.value);
            }
        }
        Ok(by_date
            .into_iter()
            .map(|(date, metrics)| DatedUsage {
                date,
                metrics: metrics.into_iter().collect(),
            })
            .collect())
    }

    async fn unallocated_residuals(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
        tolerance: Amount,
    ) -> Result<Vec<Recommendation>, StorageError> {
        let inner = self.inner.read().await;
        let mut holistic: HashMap<Uuid, Amount> = HashMap::new();
        for row in rows_in_range(&inner.allocations, run_id, start, end) {
            *holistic.entry(row.node_id).or_insert(Amount::ZERO) += row.total_amount;
        }
        let mut outflow: HashMap<Uuid, Amount> = HashMap::new();
        for row in &inner.contributions {
            if row.run_id == *run_id
                && row.contribution_date >= start
                && row.contribution_date <= end
            {
                *outflow.entry(row.parent_id).or_insert(Amount::ZERO) += row.contributed_amount;
            }
        }

        let nodes_by_id: HashMap<Uuid, &CostNode> =
            inner.nodes.iter().map(|node| (node.id, node)).collect();
        let mut findings: Vec<Recommendation> = outflow
            .into_iter()
            .filter_map(|(parent, pushed)| {
                let total = holistic.get(&parent).copied().unwrap_or(Amount::ZERO);
                let residual = total - pushed;
                if residual <= tolerance {
                    return None;
                }
                let node = nodes_by_id.get(&parent)?;
                Some(Recommendation {
                    kind: RecommendationKind::UnallocatedResidual,
                    node_id: parent,
                    node_name: node.name.clone(),
                    amount: residual,
                    detail: "outgoing allocations fall short of holistic cost".to_string(),
                })
            })
            .collect();
        findings.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.node_id.cmp(&b.node_id)));
        Ok(findings)
    }

    async fn idle_resources(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
        cost_floor: Amount,
    ) -> Result<Vec<Recommendation>, StorageError> {
        let inner = self.inner.read().await;
        let mut has_usage: HashSet<Uuid> = HashSet::new();
        for ((date, node, _), row) in inner.usage.range((start, Uuid::nil(), String::new())..) {
            if *date > end {
                break;
            }
            if row.value.sign() > 0 {
                has_usage.insert(*node);
            }
        }

        let mut direct_totals: HashMap<Uuid, Amount> = HashMap::new();
        for row in rows_in_range(&inner.allocations, run_id, start, end) {
            *direct_totals.entry(row.node_id).or_insert(Amount::ZERO) += row.direct_amount;
        }

        let nodes_by_id: HashMap<Uuid, &CostNode> =
            inner.nodes.iter().map(|node| (node.id, node)).collect();
        let mut findings: Vec<Recommendation> = direct_totals
            .into_iter()
            .filter_map(|(node_id, direct)| {
                let node = nodes_by_id.get(&node_id)?;
                if node.node_type == NodeType::Product
                    || direct <= cost_floor
                    || has_usage.contains(&node_id)
                {
                    return None;
                }
                Some(Recommendation {
                    kind: RecommendationKind::IdleResource,
                    node_id,
                    node_name: node.name.clone(),
                    amount: direct,
                    detail: "direct cost with no recorded usage over the range".to_string(),
                })
            })
            .collect();
        findings.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.node_id.cmp(&b.node_id)));
        Ok(findings)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

impl Storage for MemoryStorage {}

fn rows_in_range<'a>(
    rows: &'a [AllocationResult],
    run_id: &'a Uuid,
    start: NaiveDate,
    end: NaiveDate,
) -> impl Iterator<Item = &'a AllocationResult> {
    rows.iter().filter(move |row| {
        row.run_id == *run_id && row.allocation_date >= start && row.allocation_date <= end
    })
}
