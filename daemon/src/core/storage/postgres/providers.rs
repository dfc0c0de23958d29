use async_trait::async_trait;
use chrono::NaiveDate;
use costwise_common::{
    amount::Amount,
    api::{
        CoverageSummary, DatedAmount, DatedUsage, LabelBreakdown, NodeCostSummary,
        Recommendation, RecommendationKind, TypeBreakdown,
    },
    model::{
        AllocationResult, ComputationRun, ContributionResult, CostNode, DailyCost, DailyUsage,
        DependencyEdge, EdgeStrategyOverride, LabelFilter, LabelOperator, NodeType, RunStatus,
    },
};
use rust_decimal::Decimal;
use sqlx::{QueryBuilder, Row};
use uuid::Uuid;

use super::{
    parse_node_type, CostRow, EdgeRow, NodeRow, OverrideRow, PgStorage, RunRow, UsageRow,
};
use crate::{
    config::WRITE_BATCH_SIZE,
    core::{
        error::StorageError,
        storage::{
            coverage_summary, AggregationProvider, CostProvider, EdgeProvider, NodeFilter,
            NodeProvider, RunProvider, Storage, UsageProvider,
        },
    },
};

#[async_trait]
impl NodeProvider for PgStorage {
    async fn get_nodes(&self, filter: NodeFilter) -> Result<Vec<CostNode>, StorageError> {
        trace!("get nodes, filter {:?}", filter);
        let rows: Vec<NodeRow> = sqlx::query_as(
            "SELECT id, name, type, cost_labels, is_platform, metadata, \
                    created_at, updated_at, archived_at \
             FROM cost_nodes \
             WHERE ($1::text IS NULL OR type = $1) \
               AND (NOT $2 OR archived_at IS NULL) \
             ORDER BY name, id",
        )
        .bind(filter.node_type.map(|t| t.to_string()))
        .bind(filter.exclude_archived)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(CostNode::try_from).collect()
    }

    async fn get_node_by_id(&self, id: &Uuid) -> Result<CostNode, StorageError> {
        trace!("get node by id {}", id);
        let row: Option<NodeRow> = sqlx::query_as(
            "SELECT id, name, type, cost_labels, is_platform, metadata, \
                    created_at, updated_at, archived_at \
             FROM cost_nodes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or_else(|| StorageError::NotFound(format!("node {}", id)))?
            .try_into()
    }

    async fn get_node_by_name(&self, name: &str) -> Result<Option<CostNode>, StorageError> {
        trace!("get node by name {}", name);
        let row: Option<NodeRow> = sqlx::query_as(
            "SELECT id, name, type, cost_labels, is_platform, metadata, \
                    created_at, updated_at, archived_at \
             FROM cost_nodes WHERE name = $1 ORDER BY id LIMIT 1",
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        row.map(CostNode::try_from).transpose()
    }
}

#[async_trait]
impl EdgeProvider for PgStorage {
    async fn get_edges_active_on(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<DependencyEdge>, StorageError> {
        trace!("get edges active on {}", date);
        let rows: Vec<EdgeRow> = sqlx::query_as(
            "SELECT id, parent_id, child_id, default_strategy, default_parameters, \
                    active_from, active_to \
             FROM dependency_edges \
             WHERE active_from <= $1 AND (active_to IS NULL OR active_to > $1) \
             ORDER BY parent_id, child_id, active_from",
        )
        .bind(date)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(DependencyEdge::from).collect())
    }

    async fn get_strategy_overrides(
        &self,
        edge_ids: &[Uuid],
    ) -> Result<Vec<EdgeStrategyOverride>, StorageError> {
        if edge_ids.is_empty() {
            return Ok(Vec::new());
        }
        trace!("get strategy overrides for {} edges", edge_ids.len());
        let rows: Vec<OverrideRow> = sqlx::query_as(
            "SELECT id, edge_id, dimension, strategy, parameters \
             FROM edge_strategies \
             WHERE edge_id = ANY($1) \
             ORDER BY edge_id, dimension NULLS FIRST",
        )
        .bind(edge_ids.to_vec())
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(EdgeStrategyOverride::from).collect())
    }
}

#[async_trait]
impl CostProvider for PgStorage {
    async fn get_costs_for_date(
        &self,
        date: NaiveDate,
        dimensions: Option<&[String]>,
    ) -> Result<Vec<DailyCost>, StorageError> {
        trace!("get costs for {}", date);
        let rows: Vec<CostRow> = sqlx::query_as(
            "SELECT node_id, cost_date, dimension, amount, currency, metadata \
             FROM node_costs_by_dimension \
             WHERE cost_date = $1 AND ($2::text[] IS NULL OR dimension = ANY($2)) \
             ORDER BY node_id, dimension",
        )
        .bind(date)
        .bind(dimensions.map(|set| set.to_vec()))
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(DailyCost::from).collect())
    }

    async fn upsert_costs(&self, costs: &[DailyCost]) -> Result<(), StorageError> {
        debug!("upserting {} cost rows", costs.len());
        for chunk in costs.chunks(WRITE_BATCH_SIZE) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO node_costs_by_dimension \
                 (node_id, cost_date, dimension, amount, currency, metadata) ",
            );
            builder.push_values(chunk, |mut bindings, cost| {
                bindings
                    .push_bind(cost.node_id)
                    .push_bind(cost.cost_date)
                    .push_bind(&cost.dimension)
                    .push_bind(cost.amount.into_inner())
                    .push_bind(&cost.currency)
                    .push_bind(&cost.metadata);
            });
            builder.push(
                " ON CONFLICT (node_id, cost_date, dimension) DO UPDATE SET \
                 amount = EXCLUDED.amount, currency = EXCLUDED.currency, \
                 metadata = EXCLUDED.metadata, updated_at = now()",
            );
            builder.build().execute(self.pool()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UsageProvider for PgStorage {
    async fn get_usage_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        metrics: Option<&[String]>,
        filters: &[LabelFilter],
    ) -> Result<Vec<DailyUsage>, StorageError> {
        trace!("get usage from {} to {}", start, end);
        let mut builder = QueryBuilder::new(
            "SELECT node_id, usage_date, metric, value, unit, labels \
             FROM node_usage_by_dimension WHERE usage_date BETWEEN ",
        );
        builder.push_bind(start);
        builder.push(" AND ");
        builder.push_bind(end);
        if let Some(metrics) = metrics {
            builder.push(" AND metric = ANY(");
            builder.push_bind(metrics.to_vec());
            builder.push(")");
        }
        for filter in filters {
            match filter.operator {
                LabelOperator::Eq => {
                    builder.push(" AND labels ->> ");
                    builder.push_bind(&filter.label);
                    builder.push(" = ");
                    builder.push_bind(filter.values.first().cloned().unwrap_or_default());
                }
                LabelOperator::In => {
                    builder.push(" AND labels ->> ");
                    builder.push_bind(&filter.label);
                    builder.push(" = ANY(");
                    builder.push_bind(filter.values.clone());
                    builder.push(")");
                }
                LabelOperator::Exists => {
                    builder.push(" AND jsonb_exists(labels, ");
                    builder.push_bind(&filter.label);
                    builder.push(")");
                }
            }
        }
        builder.push(" ORDER BY usage_date, node_id, metric");

        let rows: Vec<UsageRow> = builder.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter().map(DailyUsage::try_from).collect()
    }

    async fn upsert_usage(&self, usage: &[DailyUsage]) -> Result<(), StorageError> {
        debug!("upserting {} usage rows", usage.len());
        for chunk in usage.chunks(WRITE_BATCH_SIZE) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO node_usage_by_dimension \
                 (node_id, usage_date, metric, value, unit, labels) ",
            );
            builder.push_values(chunk, |mut bindings, row| {
                bindings
                    .push_bind(row.node_id)
                    .push_bind(row.usage_date)
                    .push_bind(&row.metric)
                    .push_bind(row.value.into_inner())
                    .push_bind(&row.unit)
                    .push_bind(sqlx::types::Json(&row.labels));
            });
            builder.push(
                " ON CONFLICT (node_id, usage_date, metric) DO UPDATE SET \
                 value = EXCLUDED.value, unit = EXCLUDED.unit, \
                 labels = EXCLUDED.labels, updated_at = now()",
            );
            builder.build().execute(self.pool()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RunProvider for PgStorage {
    async fn create_run(
        &self,
        window_start: NaiveDate,
        window_end: NaiveDate,
        notes: Option<String>,
    ) -> Result<ComputationRun, StorageError> {
        let row: RunRow = sqlx::query_as(
            "INSERT INTO computation_runs (id, window_start, window_end, status, notes) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, window_start, window_end, graph_hash, status, notes, \
                       created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(window_start)
        .bind(window_end)
        .bind(RunStatus::Pending.to_string())
        .bind(notes)
        .fetch_one(self.pool())
        .await?;
        row.try_into()
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<ComputationRun, StorageError> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT id, window_start, window_end, graph_hash, status, notes, \
                    created_at, updated_at \
             FROM computation_runs WHERE id = $1",
        )
        .bind(run_id)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or_else(|| StorageError::NotFound(format!("run {}", run_id)))?
            .try_into()
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<ComputationRun>, StorageError> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT id, window_start, window_end, graph_hash, status, notes, \
                    created_at, updated_at \
             FROM computation_runs ORDER BY created_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(ComputationRun::try_from).collect()
    }

    async fn set_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        notes: Option<String>,
    ) -> Result<(), StorageError> {
        debug!("run {}: status -> {}", run_id, status);
        // terminal runs are immutable, the guard makes the update a no-op
        let result = sqlx::query(
            "UPDATE computation_runs \
             SET status = $2, notes = COALESCE($3, notes), updated_at = now() \
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(run_id)
        .bind(status.to_string())
        .bind(notes)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ConstraintViolation(format!(
                "run {} is missing or already terminal",
                run_id
            )));
        }
        Ok(())
    }

    async fn set_run_graph_hash(
        &self,
        run_id: &Uuid,
        graph_hash: &str,
    ) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE computation_runs SET graph_hash = $2, updated_at = now() WHERE id = $1")
                .bind(run_id)
                .bind(graph_hash)
                .execute(self.pool())
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("run {}", run_id)));
        }
        Ok(())
    }

    async fn insert_allocation_results(
        &self,
        rows: &[AllocationResult],
    ) -> Result<(), StorageError> {
        for chunk in rows.chunks(WRITE_BATCH_SIZE) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO allocation_results_by_dimension \
                 (run_id, node_id, allocation_date, dimension, \
                  direct_amount, indirect_amount, total_amount) ",
            );
            builder.push_values(chunk, |mut bindings, row| {
                bindings
                    .push_bind(row.run_id)
                    .push_bind(row.node_id)
                    .push_bind(row.allocation_date)
                    .push_bind(&row.dimension)
                    .push_bind(row.direct_amount.into_inner())
                    .push_bind(row.indirect_amount.into_inner())
                    .push_bind(row.total_amount.into_inner());
            });
            builder.build().execute(self.pool()).await?;
        }
        Ok(())
    }

    async fn insert_contribution_results(
        &self,
        rows: &[ContributionResult],
    ) -> Result<(), StorageError> {
        for chunk in rows.chunks(WRITE_BATCH_SIZE) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO contribution_results_by_dimension \
                 (run_id, parent_id, child_id, contribution_date, dimension, \
                  contributed_amount, path) ",
            );
            builder.push_values(chunk, |mut bindings, row| {
                bindings
                    .push_bind(row.run_id)
                    .push_bind(row.parent_id)
                    .push_bind(row.child_id)
                    .push_bind(row.contribution_date)
                    .push_bind(&row.dimension)
                    .push_bind(row.contributed_amount.into_inner())
                    .push_bind(row.path.clone());
            });
            builder.build().execute(self.pool()).await?;
        }
        Ok(())
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM computation_runs WHERE id = $1")
            .bind(run_id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("run {}", run_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl AggregationProvider for PgStorage {
    async fn latest_completed_run(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<ComputationRun>, StorageError> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT id, window_start, window_end, graph_hash, status, notes, \
                    created_at, updated_at \
             FROM computation_runs \
             WHERE status = 'completed' AND window_start <= $1 AND window_end >= $2 \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(start)
        .bind(end)
        .fetch_optional(self.pool())
        .await?;
        row.map(ComputationRun::try_from).transpose()
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
        let rows = sqlx::query(
            "SELECT n.id, n.name, n.type, n.is_platform, SUM(a.total_amount) AS total_amount \
             FROM allocation_results_by_dimension a \
             JOIN cost_nodes n ON n.id = a.node_id \
             WHERE a.run_id = $1 AND a.allocation_date BETWEEN $2 AND $3 \
               AND ($4::text IS NULL OR n.type = $4) \
             GROUP BY n.id, n.name, n.type, n.is_platform \
             ORDER BY total_amount DESC, n.id \
             LIMIT $5 OFFSET $6",
        )
        .bind(run_id)
        .bind(start)
        .bind(end)
        .bind(node_type.map(|t| t.to_string()))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(NodeCostSummary {
                    id: row.try_get("id").map_err(StorageError::from)?,
                    name: row.try_get("name").map_err(StorageError::from)?,
                    node_type: parse_node_type(
                        row.try_get::<String, _>("type")
                            .map_err(StorageError::from)?
                            .as_str(),
                    )?,
                    is_platform: row.try_get("is_platform").map_err(StorageError::from)?,
                    total_amount: Amount::new(
                        row.try_get::<Decimal, _>("total_amount")
                            .map_err(StorageError::from)?,
                    ),
                })
            })
            .collect()
    }

    async fn coverage(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<CoverageSummary, StorageError> {
        let final_total: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(a.total_amount), 0) \
             FROM allocation_results_by_dimension a \
             JOIN cost_nodes n ON n.id = a.node_id \
             WHERE a.run_id = $1 AND a.allocation_date BETWEEN $2 AND $3 \
               AND n.type = 'product' \
               AND NOT EXISTS ( \
                   SELECT 1 FROM dependency_edges e \
                   JOIN cost_nodes child ON child.id = e.child_id \
                   WHERE e.parent_id = n.id AND child.type = 'product' \
                     AND e.active_from <= $3 \
                     AND (e.active_to IS NULL OR e.active_to > $2))",
        )
        .bind(run_id)
        .bind(start)
        .bind(end)
        .fetch_one(self.pool())
        .await?;

        let infra_total: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(a.direct_amount), 0) \
             FROM allocation_results_by_dimension a \
             JOIN cost_nodes n ON n.id = a.node_id \
             WHERE a.run_id = $1 AND a.allocation_date BETWEEN $2 AND $3 \
               AND (n.type <> 'product' OR n.is_platform)",
        )
        .bind(run_id)
        .bind(start)
        .bind(end)
        .fetch_one(self.pool())
        .await?;

        Ok(coverage_summary(
            Amount::new(final_total),
            Amount::new(infra_total),
        ))
    }

    async fn costs_by_type(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TypeBreakdown>, StorageError> {
        let rows = sqlx::query(
            "SELECT n.type, SUM(a.total_amount) AS total_amount, \
                    COUNT(DISTINCT n.id) AS node_count \
             FROM allocation_results_by_dimension a \
             JOIN cost_nodes n ON n.id = a.node_id \
             WHERE a.run_id = $1 AND a.allocation_date BETWEEN $2 AND $3 \
             GROUP BY n.type \
             ORDER BY total_amount DESC",
        )
        .bind(run_id)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TypeBreakdown {
                    node_type: parse_node_type(
                        row.try_get::<String, _>("type")
                            .map_err(StorageError::from)?
                            .as_str(),
                    )?,
                    total_amount: Amount::new(
                        row.try_get::<Decimal, _>("total_amount")
                            .map_err(StorageError::from)?,
                    ),
                    node_count: row.try_get("node_count").map_err(StorageError::from)?,
                })
            })
            .collect()
    }

    async fn costs_by_label(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
        key: &str,
    ) -> Result<Vec<LabelBreakdown>, StorageError> {
        let rows = sqlx::query(
            "SELECT n.cost_labels ->> $4 AS value, SUM(a.total_amount) AS total_amount, \
                    COUNT(DISTINCT n.id) AS node_count \
             FROM allocation_results_by_dimension a \
             JOIN cost_nodes n ON n.id = a.node_id \
             WHERE a.run_id = $1 AND a.allocation_date BETWEEN $2 AND $3 \
               AND jsonb_exists(n.cost_labels, $4) \
             GROUP BY 1 \
             ORDER BY total_amount DESC, value",
        )
        .bind(run_id)
        .bind(start)
        .bind(end)
        .bind(key)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(LabelBreakdown {
                    value: row.try_get("value").map_err(StorageError::from)?,
                    total_amount: Amount::new(
                        row.try_get::<Decimal, _>("total_amount")
                            .map_err(StorageError::from)?,
                    ),
                    node_count: row.try_get("node_count").map_err(StorageError::from)?,
                })
            })
            .collect()
    }

    async fn node_cost_series(
        &self,
        run_id: &Uuid,
        node_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DatedAmount>, StorageError> {
        let rows = sqlx::query(
            "SELECT allocation_date, SUM(total_amount) AS total_amount \
             FROM allocation_results_by_dimension \
             WHERE run_id = $1 AND node_id = $2 AND allocation_date BETWEEN $3 AND $4 \
             GROUP BY allocation_date \
             ORDER BY allocation_date",
        )
        .bind(run_id)
        .bind(node_id)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DatedAmount {
                    date: row.try_get("allocation_date").map_err(StorageError::from)?,
                    total_amount: Amount::new(
                        row.try_get::<Decimal, _>("total_amount")
                            .map_err(StorageError::from)?,
                    ),
                })
            })
            .collect()
    }

    async fn node_usage_series(
        &self,
        node_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DatedUsage>, StorageError> {
        let rows = sqlx::query(
            "SELECT usage_date, metric, value \
             FROM node_usage_by_dimension \
             WHERE node_id = $1 AND usage_date BETWEEN $2 AND $3 \
             ORDER BY usage_date, metric",
        )
        .bind(node_id)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool())
        .await?;

        let mut series: Vec<DatedUsage> = Vec::new();
        for row in rows {
            let date: NaiveDate = row.try_get("usage_date").map_err(StorageError::from)?;
            let metric: String = row.try_get("metric").map_err(StorageError::from)?;
            let value = Amount::new(row.try_get::<Decimal, _>("value").map_err(StorageError::from)?);
            match series.last_mut() {
                Some(entry) if entry.date == date => {
                    entry.metrics.insert(metric, value);
                }
                _ => {
                    let mut metrics = indexmap::IndexMap::new();
                    metrics.insert(metric, value);
                    series.push(DatedUsage { date, metrics });
                }
            }
        }
        Ok(series)
    }

    async fn unallocated_residuals(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
        tolerance: Amount,
    ) -> Result<Vec<Recommendation>, StorageError> {
        let rows = sqlx::query(
            "WITH holistic AS ( \
                 SELECT node_id, SUM(total_amount) AS amount \
                 FROM allocation_results_by_dimension \
                 WHERE run_id = $1 AND allocation_date BETWEEN $2 AND $3 \
                 GROUP BY node_id), \
             outflow AS ( \
                 SELECT parent_id, SUM(contributed_amount) AS amount \
                 FROM contribution_results_by_dimension \
                 WHERE run_id = $1 AND contribution_date BETWEEN $2 AND $3 \
                 GROUP BY parent_id) \
             SELECT n.id, n.name, h.amount - o.amount AS residual \
             FROM outflow o \
             JOIN holistic h ON h.node_id = o.parent_id \
             JOIN cost_nodes n ON n.id = o.parent_id \
             WHERE h.amount - o.amount > $4 \
             ORDER BY residual DESC, n.id",
        )
        .bind(run_id)
        .bind(start)
        .bind(end)
        .bind(tolerance.into_inner())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Recommendation {
                    kind: RecommendationKind::UnallocatedResidual,
                    node_id: row.try_get("id").map_err(StorageError::from)?,
                    node_name: row.try_get("name").map_err(StorageError::from)?,
                    amount: Amount::new(
                        row.try_get::<Decimal, _>("residual").map_err(StorageError::from)?,
                    ),
                    detail: "outgoing allocations fall short of holistic cost".to_string(),
                })
            })
            .collect()
    }

    async fn idle_resources(
        &self,
        run_id: &Uuid,
        start: NaiveDate,
        end: NaiveDate,
        cost_floor: Amount,
    ) -> Result<Vec<Recommendation>, StorageError> {
        let rows = sqlx::query(
            "SELECT n.id, n.name, SUM(a.direct_amount) AS direct_total \
             FROM allocation_results_by_dimension a \
             JOIN cost_nodes n ON n.id = a.node_id \
             WHERE a.run_id = $1 AND a.allocation_date BETWEEN $2 AND $3 \
               AND n.type <> 'product' \
               AND NOT EXISTS ( \
                   SELECT 1 FROM node_usage_by_dimension u \
                   WHERE u.node_id = n.id \
                     AND u.usage_date BETWEEN $2 AND $3 AND u.value > 0) \
             GROUP BY n.id, n.name \
             HAVING SUM(a.direct_amount) > $4 \
             ORDER BY direct_total DESC, n.id",
        )
        .bind(run_id)
        .bind(start)
        .bind(end)
        .bind(cost_floor.into_inner())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Recommendation {
                    kind: RecommendationKind::IdleResource,
                    node_id: row.try_get("id").map_err(StorageError::from)?,
                    node_name: row.try_get("name").map_err(StorageError::from)?,
                    amount: Amount::new(
                        row.try_get::<Decimal, _>("direct_total")
                            .map_err(StorageError::from)?,
                    ),
                    detail: "direct cost with no recorded usage over the range".to_string(),
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(self.pool())
            .await?;
        Ok(())
    }
}

impl Storage for PgStorage {}
