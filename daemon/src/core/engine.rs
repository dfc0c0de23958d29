//! The allocation engine.
//!
//! One engine execution ("run") walks a date window day by day. Each day is
//! independent: the engine builds the graph active on that day, loads the
//! day's direct costs, pushes cost down the topological order and records
//! per-node allocation rows plus per-edge contribution rows. Nothing is
//! persisted until every day has been computed; a failure anywhere leaves
//! no durable allocation rows (the failed run's partial batches are
//! invisible to readers and cascade away with the run row).
//!
//! Invariant checks are reports, not guards: operators configure share sums
//! above one often enough that the engine must complete and let them see
//! the resulting rows.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{Duration, NaiveDate};
use costwise_common::{
    amount::Amount,
    model::{AllocationResult, ComputationRun, ContributionResult, RunStatus},
    time::days_inclusive,
};
use uuid::Uuid;

use super::{
    error::AllocationError,
    graph::{build_graph, NodeIndex},
    storage::Storage,
    strategy::{ShareContext, StrategyResolver, UsageIndex},
};
use crate::config::{invariant_tolerance, WRITE_BATCH_SIZE};

/// Cooperative cancellation flag, checked at repository boundaries. The
/// in-memory traversal itself never blocks and is not interruptible.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    /// Explicit dimension set. `None` discovers the dimensions present in
    /// each day's cost records; an explicit set also materialises zero rows
    /// on days with no data.
    pub dimensions: Option<Vec<String>>,
    pub notes: Option<String>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run: ComputationRun,
    pub allocation_rows: usize,
    pub contribution_rows: usize,
    pub invariant_violations: usize,
}

struct DayOutput {
    allocations: Vec<AllocationResult>,
    contributions: Vec<ContributionResult>,
    graph_hash: String,
    violations: usize,
}

pub struct AllocationEngine<S: Storage> {
    storage: Arc<S>,
    cancellation: CancellationHandle,
}

impl<S: Storage> AllocationEngine<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            cancellation: CancellationHandle::new(),
        }
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    /// Drive one run to a terminal state. The returned outcome carries the
    /// final run row; `Err` means the run row is marked failed with the
    /// error in its notes.
    pub async fn execute(&self, request: RunRequest) -> Result<RunOutcome, AllocationError> {
        if request.window_start > request.window_end {
            return Err(AllocationError::InvalidWindow(format!(
                "window start {} is after window end {}",
                request.window_start, request.window_end
            )));
        }

        let run = self
            .storage
            .create_run(
                request.window_start,
                request.window_end,
                request.notes.clone(),
            )
            .await?;
        info!(
            "run {}: created for window {} to {}",
            run.id, request.window_start, request.window_end
        );
        self.update_status(&run.id, RunStatus::Running, None).await;

        match self.execute_inner(&run, &request).await {
            Ok((allocation_rows, contribution_rows, invariant_violations)) => {
                self.update_status(&run.id, RunStatus::Completed, None).await;
                info!(
                    "run {}: completed with {} allocation rows, {} contribution rows, {} invariant violations",
                    run.id, allocation_rows, contribution_rows, invariant_violations
                );
                let run = self.storage.get_run(&run.id).await.unwrap_or(run);
                Ok(RunOutcome {
                    run,
                    allocation_rows,
                    contribution_rows,
                    invariant_violations,
                })
            }
            Err(err) => {
                error!("run {}: failed: {}", run.id, err);
                self.update_status(&run.id, RunStatus::Failed, Some(err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    async fn execute_inner(
        &self,
        run: &ComputationRun,
        request: &RunRequest,
    ) -> Result<(usize, usize, usize), AllocationError> {
        let mut allocations = Vec::new();
        let mut contributions = Vec::new();
        let mut violations = 0usize;
        let mut hash_recorded = false;

        for date in days_inclusive(request.window_start, request.window_end) {
            self.ensure_not_cancelled(&run.id)?;
            let day = self
                .process_day(run, date, request.dimensions.as_deref())
                .await?;

            if !hash_recorded {
                // the run records the graph as it stood at window start
                if let Err(err) = self
                    .storage
                    .set_run_graph_hash(&run.id, &day.graph_hash)
                    .await
                {
                    warn!("run {}: failed to record graph hash: {}", run.id, err);
                }
                hash_recorded = true;
            }

            violations += day.violations;
            allocations.extend(day.allocations);
            contributions.extend(day.contributions);
        }

        // save phase: nothing was written before this point
        self.ensure_not_cancelled(&run.id)?;
        debug!(
            "run {}: persisting {} allocation rows and {} contribution rows",
            run.id,
            allocations.len(),
            contributions.len()
        );
        for chunk in allocations.chunks(WRITE_BATCH_SIZE) {
            self.storage.insert_allocation_results(chunk).await?;
        }
        for chunk in contributions.chunks(WRITE_BATCH_SIZE) {
            self.storage.insert_contribution_results(chunk).await?;
        }

        Ok((allocations.len(), contributions.len(), violations))
    }

    async fn process_day(
        &self,
        run: &ComputationRun,
        date: NaiveDate,
        requested_dimensions: Option<&[String]>,
    ) -> Result<DayOutput, AllocationError> {
        debug!("run {}: processing {}", run.id, date);

        // phase 1: graph and ordering
        let graph = build_graph(self.storage.as_ref(), date).await?;
        for dangling in graph.dangling_edges() {
            warn!(
                "run {}: edge {} skipped, node {} is missing",
                run.id, dangling.edge_id, dangling.missing_node
            );
        }

        // phase 2: direct costs
        self.ensure_not_cancelled(&run.id)?;
        let cost_rows = self
            .storage
            .get_costs_for_date(date, requested_dimensions)
            .await?;

        let dimensions: Vec<String> = match requested_dimensions {
            Some(dims) => dims.to_vec(),
            None => {
                let mut discovered = BTreeSet::new();
                for row in &cost_rows {
                    discovered.insert(row.dimension.clone());
                }
                discovered.into_iter().collect()
            }
        };
        let dimension_index: HashMap<&str, usize> = dimensions
            .iter()
            .enumerate()
            .map(|(position, dimension)| (dimension.as_str(), position))
            .collect();

        let node_count = graph.node_count();
        let dim_count = dimensions.len();
        let mut direct = vec![vec![Amount::ZERO; dim_count]; node_count];
        let mut raw_totals = vec![Amount::ZERO; dim_count];
        for row in &cost_rows {
            let Some(&dim_pos) = dimension_index.get(row.dimension.as_str()) else {
                continue;
            };
            raw_totals[dim_pos] += row.amount;
            match graph.node_index(&row.node_id) {
                Some(node) => direct[node as usize][dim_pos] += row.amount,
                None => warn!(
                    "run {}: cost record for unknown node {} on {} ignored",
                    run.id, row.node_id, date
                ),
            }
        }

        // phase 3: full indirect matrix so traversal reads are branchless
        let mut indirect = vec![vec![Amount::ZERO; dim_count]; node_count];

        // resolve every (edge, dimension) once, then prefetch exactly the
        // usage the resolved strategies will read
        let mut resolver = StrategyResolver::new();
        let mut metrics: BTreeSet<String> = BTreeSet::new();
        let mut max_lookback = 1u32;
        for edge in graph.edges() {
            for dimension in &dimensions {
                let spec = resolver.resolve(edge, dimension);
                if let Some(metric) = spec.metric() {
                    metrics.insert(metric.to_string());
                    max_lookback = max_lookback.max(spec.lookback_days());
                }
            }
        }

        let usage = if metrics.is_empty() {
            UsageIndex::empty()
        } else {
            self.ensure_not_cancelled(&run.id)?;
            let metric_list: Vec<String> = metrics.into_iter().collect();
            let window_start = date - Duration::days((max_lookback - 1) as i64);
            let rows = self
                .storage
                .get_usage_in_range(window_start, date, Some(&metric_list), &[])
                .await?;
            UsageIndex::from_rows(rows)
        };

        // children per parent, one entry per outgoing edge, repo order
        let children_ids: Vec<Vec<Uuid>> = (0..node_count)
            .map(|position| {
                graph
                    .edges_from(position as NodeIndex)
                    .map(|edge| graph.node(edge.child).id)
                    .collect()
            })
            .collect();

        // phase 4: push each node's holistic cost across its outgoing edges
        let mut contributions = Vec::new();
        let mut violations = 0usize;
        let tolerance_factor = Amount::ONE + invariant_tolerance();

        for &node in graph.topological_order() {
            let node_pos = node as usize;
            for (dim_pos, dimension) in dimensions.iter().enumerate() {
                let holistic = direct[node_pos][dim_pos] + indirect[node_pos][dim_pos];
                if holistic.is_zero() {
                    continue;
                }

                let mut outflow = Amount::ZERO;
                for edge in graph.edges_from(node) {
                    let spec = resolver.resolve(edge, dimension);
                    let share = spec.evaluate(&ShareContext {
                        date,
                        dimension,
                        child: graph.node(edge.child).id,
                        siblings: &children_ids[node_pos],
                        usage: &usage,
                    });
                    let contribution = holistic * share;
                    if contribution.is_zero() {
                        continue;
                    }

                    indirect[edge.child as usize][dim_pos] += contribution;
                    outflow += contribution;
                    contributions.push(ContributionResult {
                        run_id: run.id,
                        parent_id: graph.node(node).id,
                        child_id: graph.node(edge.child).id,
                        contribution_date: date,
                        dimension: dimension.clone(),
                        contributed_amount: contribution,
                        path: vec![graph.node(node).id, graph.node(edge.child).id],
                    });
                }

                // contribution balance: a share sum above one is an operator
                // configuration bug, reported but never fatal
                if outflow > holistic * tolerance_factor {
                    warn!(
                        "run {}: node {} pushed {} against holistic {} on {} dimension '{}'",
                        run.id,
                        graph.node(node).id,
                        outflow,
                        holistic,
                        date,
                        dimension
                    );
                    violations += 1;
                }
            }
        }

        // phase 5: materialise rows and check the day's invariants
        let mut allocations = Vec::with_capacity(node_count * dim_count);
        let mut direct_totals = vec![Amount::ZERO; dim_count];
        for node_pos in 0..node_count {
            for dim_pos in 0..dim_count {
                let direct_amount = direct[node_pos][dim_pos];
                let indirect_amount = indirect[node_pos][dim_pos];
                direct_totals[dim_pos] += direct_amount;
                allocations.push(AllocationResult {
                    run_id: run.id,
                    node_id: graph.node(node_pos as NodeIndex).id,
                    allocation_date: date,
                    dimension: dimensions[dim_pos].clone(),
                    direct_amount,
                    indirect_amount,
                    total_amount: direct_amount + indirect_amount,
                });
            }
        }

        // conservation: the rows must carry exactly what was ingested
        for dim_pos in 0..dim_count {
            let written = direct_totals[dim_pos];
            let ingested = raw_totals[dim_pos];
            let delta = if written >= ingested {
                written - ingested
            } else {
                ingested - written
            };
            if delta > ingested * invariant_tolerance() {
                warn!(
                    "run {}: conservation violated on {} dimension '{}': rows carry {}, records carry {}",
                    run.id, date, dimensions[dim_pos], written, ingested
                );
                violations += 1;
            }
        }

        // no amplification: final cost centres must not exceed what the
        // infrastructure actually cost
        let final_centres = graph.get_final_cost_centres();
        for dim_pos in 0..dim_count {
            let centre_total: Amount = final_centres
                .iter()
                .map(|&centre| {
                    direct[centre as usize][dim_pos] + indirect[centre as usize][dim_pos]
                })
                .sum();
            let infra_direct: Amount = graph
                .nodes()
                .iter()
                .enumerate()
                .filter(|(_, node)| node.is_infrastructure_like())
                .map(|(position, _)| direct[position][dim_pos])
                .sum();
            if centre_total > infra_direct * tolerance_factor {
                warn!(
                    "run {}: amplification on {} dimension '{}': final cost centres carry {}, raw infrastructure cost is {}",
                    run.id, date, dimensions[dim_pos], centre_total, infra_direct
                );
                violations += 1;
            }
        }

        Ok(DayOutput {
            allocations,
            contributions,
            graph_hash: graph.hash().to_string(),
            violations,
        })
    }

    // status updates are best-effort: a failed update must not abort the run
    async fn update_status(&self, run_id: &Uuid, status: RunStatus, notes: Option<String>) {
        if let Err(err) = self.storage.set_run_status(run_id, status, notes).await {
            warn!("run {}: failed to update status to {}: {}", run_id, status, err);
        }
    }

    fn ensure_not_cancelled(&self, run_id: &Uuid) -> Result<(), AllocationError> {
        if self.cancellation.is_cancelled() {
            return Err(AllocationError::Cancelled(*run_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::REPORT_DECIMAL_PLACES;
    use crate::core::storage::{AggregationProvider, MemoryStorage, RunProvider};
    use chrono::Utc;
    use costwise_common::model::{
        CostNode, DailyCost, DailyUsage, DependencyEdge, EdgeStrategyOverride, NodeType,
    };
    use serde_json::{json, Value};
    use std::str::FromStr;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn amount(s: &str) -> Amount {
        Amount::from_str(s).unwrap()
    }

    fn create_test_node(name: &str, node_type: NodeType) -> CostNode {
        CostNode {
            id: Uuid::new_v4(),
            name: name.to_string(),
            node_type,
            is_platform: false,
            cost_labels: indexmap::IndexMap::new(),
            metadata: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            archived_at: None,
        }
    }

    fn create_test_edge(
        parent: &CostNode,
        child: &CostNode,
        strategy: &str,
        parameters: Value,
    ) -> DependencyEdge {
        DependencyEdge {
            id: Uuid::new_v4(),
            parent_id: parent.id,
            child_id: child.id,
            default_strategy: strategy.to_string(),
            default_parameters: parameters,
            active_from: date("2024-01-01"),
            active_to: None,
        }
    }

    fn cost(node: &CostNode, day: &str, dimension: &str, value: &str) -> DailyCost {
        DailyCost {
            node_id: node.id,
            cost_date: date(day),
            dimension: dimension.to_string(),
            amount: amount(value),
            currency: "USD".to_string(),
            metadata: Value::Null,
        }
    }

    fn usage(node: &CostNode, day: &str, metric: &str, value: &str) -> DailyUsage {
        DailyUsage {
            node_id: node.id,
            usage_date: date(day),
            metric: metric.to_string(),
            value: amount(value),
            unit: String::new(),
            labels: indexmap::IndexMap::new(),
        }
    }

    async fn run_window(
        storage: &Arc<MemoryStorage>,
        from: &str,
        to: &str,
        dimensions: Option<Vec<String>>,
    ) -> RunOutcome {
        let engine = AllocationEngine::new(storage.clone());
        engine
            .execute(RunRequest {
                window_start: date(from),
                window_end: date(to),
                dimensions,
                notes: None,
            })
            .await
            .unwrap()
    }

    fn row_for<'a>(
        rows: &'a [AllocationResult],
        node: &CostNode,
        dimension: &str,
    ) -> &'a AllocationResult {
        rows.iter()
            .find(|row| row.node_id == node.id && row.dimension == dimension)
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_resource_to_single_product() {
        let resource = create_test_node("vm", NodeType::Resource);
        let product = create_test_node("checkout", NodeType::Product);
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(
                vec![resource.clone(), product.clone()],
                vec![create_test_edge(&resource, &product, "equal", json!({}))],
                Vec::new(),
            )
            .await;
        storage
            .seed_costs(vec![cost(&resource, "2024-01-01", "compute_hours", "100")])
            .await;

        let outcome = run_window(&storage, "2024-01-01", "2024-01-01", None).await;
        assert_eq!(outcome.run.status, RunStatus::Completed);
        assert_eq!(outcome.invariant_violations, 0);
        assert!(outcome.run.graph_hash.is_some());

        let rows = storage.allocation_rows(&outcome.run.id).await;
        assert_eq!(rows.len(), 2);
        let resource_row = row_for(&rows, &resource, "compute_hours");
        assert_eq!(resource_row.direct_amount, amount("100"));
        assert_eq!(resource_row.indirect_amount, Amount::ZERO);
        assert_eq!(resource_row.total_amount, amount("100"));
        let product_row = row_for(&rows, &product, "compute_hours");
        assert_eq!(product_row.direct_amount, Amount::ZERO);
        assert_eq!(product_row.indirect_amount, amount("100"));
        assert_eq!(product_row.total_amount, amount("100"));

        let contributions = storage.contribution_rows(&outcome.run.id).await;
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].parent_id, resource.id);
        assert_eq!(contributions[0].child_id, product.id);
        assert_eq!(contributions[0].contributed_amount, amount("100"));
        assert_eq!(contributions[0].path, vec![resource.id, product.id]);
    }

    #[tokio::test]
    async fn test_shared_service_split_equally_across_three_products() {
        let shared = create_test_node("auth", NodeType::Shared);
        let products: Vec<CostNode> = ["a", "b", "c"]
            .iter()
            .map(|name| create_test_node(name, NodeType::Product))
            .collect();
        let edges = products
            .iter()
            .map(|product| create_test_edge(&shared, product, "equal", json!({})))
            .collect();
        let storage = Arc::new(MemoryStorage::new());
        let mut nodes = vec![shared.clone()];
        nodes.extend(products.clone());
        storage.seed_graph(nodes, edges, Vec::new()).await;
        storage
            .seed_costs(vec![cost(&shared, "2024-01-01", "compute_hours", "300")])
            .await;

        let outcome = run_window(&storage, "2024-01-01", "2024-01-01", None).await;
        assert_eq!(outcome.invariant_violations, 0);

        let rows = storage.allocation_rows(&outcome.run.id).await;
        for product in &products {
            let row = row_for(&rows, product, "compute_hours");
            // 300/3 through an inexact 1/3 share, exact again at 2 decimals
            assert_eq!(
                row.indirect_amount.rounded(REPORT_DECIMAL_PLACES),
                amount("100")
            );
        }
    }

    #[tokio::test]
    async fn test_platform_proportional_on_usage() {
        let platform = create_test_node("k8s", NodeType::Platform);
        let a = create_test_node("search", NodeType::Product);
        let b = create_test_node("feed", NodeType::Product);
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(
                vec![platform.clone(), a.clone(), b.clone()],
                vec![
                    create_test_edge(
                        &platform,
                        &a,
                        "proportional_on",
                        json!({"metric": "cpu_hours"}),
                    ),
                    create_test_edge(
                        &platform,
                        &b,
                        "proportional_on",
                        json!({"metric": "cpu_hours"}),
                    ),
                ],
                Vec::new(),
            )
            .await;
        storage
            .seed_costs(vec![cost(&platform, "2024-01-01", "compute_hours", "500")])
            .await;
        storage
            .seed_usage(vec![
                usage(&a, "2024-01-01", "cpu_hours", "1000"),
                usage(&b, "2024-01-01", "cpu_hours", "4000"),
            ])
            .await;

        let outcome = run_window(&storage, "2024-01-01", "2024-01-01", None).await;
        let rows = storage.allocation_rows(&outcome.run.id).await;
        assert_eq!(
            row_for(&rows, &a, "compute_hours").indirect_amount,
            amount("100")
        );
        assert_eq!(
            row_for(&rows, &b, "compute_hours").indirect_amount,
            amount("400")
        );
    }

    #[tokio::test]
    async fn test_capped_proportional_leaves_residual() {
        let platform = create_test_node("gpu-pool", NodeType::Platform);
        let a = create_test_node("training", NodeType::Product);
        let b = create_test_node("inference", NodeType::Product);
        let params = json!({"metric": "gpu_hours", "cap": 0.5});
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(
                vec![platform.clone(), a.clone(), b.clone()],
                vec![
                    create_test_edge(&platform, &a, "capped_proportional", params.clone()),
                    create_test_edge(&platform, &b, "capped_proportional", params),
                ],
                Vec::new(),
            )
            .await;
        storage
            .seed_costs(vec![cost(&platform, "2024-01-01", "compute_hours", "1000")])
            .await;
        storage
            .seed_usage(vec![
                usage(&a, "2024-01-01", "gpu_hours", "900"),
                usage(&b, "2024-01-01", "gpu_hours", "100"),
            ])
            .await;

        let outcome = run_window(&storage, "2024-01-01", "2024-01-01", None).await;
        // the residual is legitimate, not an invariant violation
        assert_eq!(outcome.invariant_violations, 0);

        let rows = storage.allocation_rows(&outcome.run.id).await;
        assert_eq!(
            row_for(&rows, &a, "compute_hours").indirect_amount,
            amount("500")
        );
        assert_eq!(
            row_for(&rows, &b, "compute_hours").indirect_amount,
            amount("100")
        );

        // the 400 left on the platform surfaces as a recommendation
        let residuals = storage
            .unallocated_residuals(
                &outcome.run.id,
                date("2024-01-01"),
                date("2024-01-01"),
                invariant_tolerance(),
            )
            .await
            .unwrap();
        assert_eq!(residuals.len(), 1);
        assert_eq!(residuals[0].node_id, platform.id);
        assert_eq!(residuals[0].amount, amount("400"));
    }

    #[tokio::test]
    async fn test_diamond_rolls_up_to_single_final_cost_centre() {
        let platform = create_test_node("base", NodeType::Platform);
        let a = create_test_node("tier-a", NodeType::Product);
        let b = create_test_node("tier-b", NodeType::Product);
        let c = create_test_node("bundle", NodeType::Product);
        let all_of_it = json!({"percent": 100});
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(
                vec![platform.clone(), a.clone(), b.clone(), c.clone()],
                vec![
                    create_test_edge(&platform, &a, "equal", json!({})),
                    create_test_edge(&platform, &b, "equal", json!({})),
                    create_test_edge(&a, &c, "fixed_percent", all_of_it.clone()),
                    create_test_edge(&b, &c, "fixed_percent", all_of_it),
                ],
                Vec::new(),
            )
            .await;
        storage
            .seed_costs(vec![cost(&platform, "2024-01-01", "compute_hours", "1000")])
            .await;

        let outcome = run_window(&storage, "2024-01-01", "2024-01-01", None).await;
        assert_eq!(outcome.invariant_violations, 0);

        let rows = storage.allocation_rows(&outcome.run.id).await;
        assert_eq!(
            row_for(&rows, &a, "compute_hours").indirect_amount,
            amount("500")
        );
        assert_eq!(
            row_for(&rows, &b, "compute_hours").indirect_amount,
            amount("500")
        );
        // the junction node sums both branches
        assert_eq!(
            row_for(&rows, &c, "compute_hours").indirect_amount,
            amount("1000")
        );
    }

    #[tokio::test]
    async fn test_zero_usage_falls_back_to_equal_split() {
        let platform = create_test_node("cache", NodeType::Platform);
        let products: Vec<CostNode> = ["a", "b", "c"]
            .iter()
            .map(|name| create_test_node(name, NodeType::Product))
            .collect();
        let edges = products
            .iter()
            .map(|product| {
                create_test_edge(&platform, product, "proportional_on", json!({"metric": "x"}))
            })
            .collect();
        let storage = Arc::new(MemoryStorage::new());
        let mut nodes = vec![platform.clone()];
        nodes.extend(products.clone());
        storage.seed_graph(nodes, edges, Vec::new()).await;
        storage
            .seed_costs(vec![cost(&platform, "2024-01-01", "compute_hours", "300")])
            .await;

        let outcome = run_window(&storage, "2024-01-01", "2024-01-01", None).await;
        let rows = storage.allocation_rows(&outcome.run.id).await;
        for product in &products {
            assert_eq!(
                row_for(&rows, product, "compute_hours")
                    .indirect_amount
                    .rounded(REPORT_DECIMAL_PLACES),
                amount("100")
            );
        }
    }

    #[tokio::test]
    async fn test_dimension_override_applies_only_to_its_dimension() {
        let shared = create_test_node("db", NodeType::Shared);
        let product = create_test_node("api", NodeType::Product);
        let edge = create_test_edge(&shared, &product, "equal", json!({}));
        let nothing_for_storage = EdgeStrategyOverride {
            id: Uuid::new_v4(),
            edge_id: edge.id,
            dimension: Some("storage_gb_month".to_string()),
            strategy: "fixed_percent".to_string(),
            parameters: json!({"percent": 0}),
        };
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(
                vec![shared.clone(), product.clone()],
                vec![edge],
                vec![nothing_for_storage],
            )
            .await;
        storage
            .seed_costs(vec![
                cost(&shared, "2024-01-01", "compute_hours", "80"),
                cost(&shared, "2024-01-01", "storage_gb_month", "40"),
            ])
            .await;

        let outcome = run_window(&storage, "2024-01-01", "2024-01-01", None).await;
        let rows = storage.allocation_rows(&outcome.run.id).await;
        // compute flows through the edge default, storage is pinned to zero
        assert_eq!(
            row_for(&rows, &product, "compute_hours").indirect_amount,
            amount("80")
        );
        assert_eq!(
            row_for(&rows, &product, "storage_gb_month").indirect_amount,
            Amount::ZERO
        );

        // a zero share emits no contribution row
        let contributions = storage.contribution_rows(&outcome.run.id).await;
        assert!(contributions
            .iter()
            .all(|row| row.dimension != "storage_gb_month"));
    }

    #[tokio::test]
    async fn test_empty_day_with_explicit_dimensions_writes_zero_rows() {
        let resource = create_test_node("vm", NodeType::Resource);
        let product = create_test_node("checkout", NodeType::Product);
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(
                vec![resource.clone(), product.clone()],
                vec![create_test_edge(&resource, &product, "equal", json!({}))],
                Vec::new(),
            )
            .await;

        let outcome = run_window(
            &storage,
            "2024-01-01",
            "2024-01-01",
            Some(vec!["compute_hours".to_string()]),
        )
        .await;
        assert_eq!(outcome.invariant_violations, 0);

        let rows = storage.allocation_rows(&outcome.run.id).await;
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.direct_amount, Amount::ZERO);
            assert_eq!(row.indirect_amount, Amount::ZERO);
            assert_eq!(row.total_amount, Amount::ZERO);
        }
        assert!(storage.contribution_rows(&outcome.run.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_day_with_discovered_dimensions_writes_nothing() {
        let resource = create_test_node("vm", NodeType::Resource);
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_graph(vec![resource], Vec::new(), Vec::new()).await;

        let outcome = run_window(&storage, "2024-01-01", "2024-01-01", None).await;
        assert_eq!(outcome.allocation_rows, 0);
        assert_eq!(outcome.contribution_rows, 0);
    }

    #[tokio::test]
    async fn test_edge_expiring_on_the_day_is_excluded() {
        let resource = create_test_node("vm", NodeType::Resource);
        let product = create_test_node("checkout", NodeType::Product);
        let mut edge = create_test_edge(&resource, &product, "equal", json!({}));
        edge.active_to = Some(date("2024-01-02"));
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(vec![resource.clone(), product.clone()], vec![edge], Vec::new())
            .await;
        storage
            .seed_costs(vec![
                cost(&resource, "2024-01-01", "compute_hours", "10"),
                cost(&resource, "2024-01-02", "compute_hours", "10"),
            ])
            .await;

        let outcome = run_window(&storage, "2024-01-01", "2024-01-02", None).await;
        let contributions = storage.contribution_rows(&outcome.run.id).await;
        // the edge carries cost on the 1st and is gone on the 2nd
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].contribution_date, date("2024-01-01"));

        let rows = storage.allocation_rows(&outcome.run.id).await;
        let second_day = rows
            .iter()
            .find(|row| row.node_id == product.id && row.allocation_date == date("2024-01-02"))
            .unwrap();
        assert_eq!(second_day.indirect_amount, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_share_sum_above_one_is_reported_not_fatal() {
        let shared = create_test_node("db", NodeType::Shared);
        let a = create_test_node("a", NodeType::Product);
        let b = create_test_node("b", NodeType::Product);
        let oversubscribed = json!({"percent": 80});
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(
                vec![shared.clone(), a.clone(), b.clone()],
                vec![
                    create_test_edge(&shared, &a, "fixed_percent", oversubscribed.clone()),
                    create_test_edge(&shared, &b, "fixed_percent", oversubscribed),
                ],
                Vec::new(),
            )
            .await;
        storage
            .seed_costs(vec![cost(&shared, "2024-01-01", "compute_hours", "100")])
            .await;

        let outcome = run_window(&storage, "2024-01-01", "2024-01-01", None).await;
        // 160% pushed: contribution balance and amplification both fire
        assert_eq!(outcome.run.status, RunStatus::Completed);
        assert!(outcome.invariant_violations >= 1);

        let rows = storage.allocation_rows(&outcome.run.id).await;
        assert_eq!(
            row_for(&rows, &a, "compute_hours").indirect_amount,
            amount("80")
        );
    }

    #[tokio::test]
    async fn test_misconfigured_strategy_degrades_to_equal() {
        let shared = create_test_node("db", NodeType::Shared);
        let product = create_test_node("api", NodeType::Product);
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(
                vec![shared.clone(), product.clone()],
                // unknown strategy name on the edge
                vec![create_test_edge(&shared, &product, "round_robin", json!({}))],
                Vec::new(),
            )
            .await;
        storage
            .seed_costs(vec![cost(&shared, "2024-01-01", "compute_hours", "42")])
            .await;

        let outcome = run_window(&storage, "2024-01-01", "2024-01-01", None).await;
        assert_eq!(outcome.run.status, RunStatus::Completed);
        let rows = storage.allocation_rows(&outcome.run.id).await;
        assert_eq!(
            row_for(&rows, &product, "compute_hours").indirect_amount,
            amount("42")
        );
    }

    #[tokio::test]
    async fn test_reruns_are_bit_identical_up_to_run_id() {
        let platform = create_test_node("k8s", NodeType::Platform);
        let a = create_test_node("a", NodeType::Product);
        let b = create_test_node("b", NodeType::Product);
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(
                vec![platform.clone(), a.clone(), b.clone()],
                vec![
                    create_test_edge(
                        &platform,
                        &a,
                        "proportional_on",
                        json!({"metric": "cpu_hours"}),
                    ),
                    create_test_edge(
                        &platform,
                        &b,
                        "proportional_on",
                        json!({"metric": "cpu_hours"}),
                    ),
                ],
                Vec::new(),
            )
            .await;
        storage
            .seed_costs(vec![
                cost(&platform, "2024-01-01", "compute_hours", "123.456789"),
                cost(&platform, "2024-01-02", "compute_hours", "77.1"),
            ])
            .await;
        storage
            .seed_usage(vec![
                usage(&a, "2024-01-01", "cpu_hours", "7"),
                usage(&b, "2024-01-01", "cpu_hours", "13"),
                usage(&a, "2024-01-02", "cpu_hours", "1"),
                usage(&b, "2024-01-02", "cpu_hours", "2"),
            ])
            .await;

        let first = run_window(&storage, "2024-01-01", "2024-01-02", None).await;
        let second = run_window(&storage, "2024-01-01", "2024-01-02", None).await;
        assert_ne!(first.run.id, second.run.id);
        assert_eq!(first.run.graph_hash, second.run.graph_hash);

        let strip_run = |rows: Vec<AllocationResult>| -> Vec<AllocationResult> {
            rows.into_iter()
                .map(|mut row| {
                    row.run_id = Uuid::nil();
                    row
                })
                .collect()
        };
        assert_eq!(
            strip_run(storage.allocation_rows(&first.run.id).await),
            strip_run(storage.allocation_rows(&second.run.id).await)
        );

        let strip_contrib = |rows: Vec<ContributionResult>| -> Vec<ContributionResult> {
            rows.into_iter()
                .map(|mut row| {
                    row.run_id = Uuid::nil();
                    row
                })
                .collect()
        };
        assert_eq!(
            strip_contrib(storage.contribution_rows(&first.run.id).await),
            strip_contrib(storage.contribution_rows(&second.run.id).await)
        );
    }

    #[tokio::test]
    async fn test_cancellation_fails_the_run() {
        let resource = create_test_node("vm", NodeType::Resource);
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(vec![resource], Vec::new(), Vec::new())
            .await;

        let engine = AllocationEngine::new(storage.clone());
        engine.cancellation_handle().cancel();
        let result = engine
            .execute(RunRequest {
                window_start: date("2024-01-01"),
                window_end: date("2024-01-03"),
                dimensions: None,
                notes: None,
            })
            .await;
        assert!(matches!(result, Err(AllocationError::Cancelled(_))));

        let runs = storage.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].notes.as_deref().unwrap_or("").contains("cancelled"));
    }

    #[tokio::test]
    async fn test_inverted_window_is_rejected_without_a_run() {
        let storage = Arc::new(MemoryStorage::new());
        let engine = AllocationEngine::new(storage.clone());
        let result = engine
            .execute(RunRequest {
                window_start: date("2024-01-02"),
                window_end: date("2024-01-01"),
                dimensions: None,
                notes: None,
            })
            .await;
        assert!(matches!(result, Err(AllocationError::InvalidWindow(_))));
        assert!(storage.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_fails_the_run() {
        let a = create_test_node("a", NodeType::Shared);
        let b = create_test_node("b", NodeType::Shared);
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(
                vec![a.clone(), b.clone()],
                vec![
                    create_test_edge(&a, &b, "equal", json!({})),
                    create_test_edge(&b, &a, "equal", json!({})),
                ],
                Vec::new(),
            )
            .await;

        let engine = AllocationEngine::new(storage.clone());
        let result = engine
            .execute(RunRequest {
                window_start: date("2024-01-01"),
                window_end: date("2024-01-01"),
                dimensions: None,
                notes: None,
            })
            .await;
        assert!(matches!(result, Err(AllocationError::CycleDetected(_))));

        let runs = storage.list_runs(10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        // a failed run leaves no durable allocation rows
        assert!(storage.allocation_rows(&runs[0].id).await.is_empty());
    }
}

