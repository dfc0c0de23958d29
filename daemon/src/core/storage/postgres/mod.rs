//! Postgres storage backend.
//!
//! Runtime-checked sqlx queries over the eight relations the system
//! persists. Schema migrations are embedded into the binary and applied on
//! connect. Every sqlx error is folded into the three storage failure
//! kinds; unique/foreign-key/check violations become `ConstraintViolation`
//! and everything else surfaces as `TransientIO`.

mod providers;

use chrono::{DateTime, NaiveDate, Utc};
use costwise_common::{
    amount::Amount,
    model::{
        ComputationRun, CostNode, DailyCost, DailyUsage, DependencyEdge, EdgeStrategyOverride,
        NodeType, RunStatus,
    },
};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::core::error::StorageError;

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        info!("connecting to Postgres with up to {} connections", max_connections);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StorageError::TransientIO(format!("migration failed: {}", err)))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_node_type(raw: &str) -> Result<NodeType, StorageError> {
    raw.parse()
        .map_err(|_| StorageError::ConstraintViolation(format!("unknown node type '{}'", raw)))
}

fn parse_run_status(raw: &str) -> Result<RunStatus, StorageError> {
    raw.parse()
        .map_err(|_| StorageError::ConstraintViolation(format!("unknown run status '{}'", raw)))
}

fn labels_from_json(value: Value) -> Result<IndexMap<String, String>, StorageError> {
    serde_json::from_value(value)
        .map_err(|err| StorageError::ConstraintViolation(format!("malformed labels map: {}", err)))
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: Uuid,
    name: String,
    #[sqlx(rename = "type")]
    node_type: String,
    cost_labels: Value,
    is_platform: bool,
    metadata: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    archived_at: Option<DateTime<Utc>>,
}

impl TryFrom<NodeRow> for CostNode {
    type Error = StorageError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        Ok(CostNode {
            id: row.id,
            name: row.name,
            node_type: parse_node_type(&row.node_type)?,
            is_platform: row.is_platform,
            cost_labels: labels_from_json(row.cost_labels)?,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
            archived_at: row.archived_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EdgeRow {
    id: Uuid,
    parent_id: Uuid,
    child_id: Uuid,
    default_strategy: String,
    default_parameters: Value,
    active_from: NaiveDate,
    active_to: Option<NaiveDate>,
}

impl From<EdgeRow> for DependencyEdge {
    fn from(row: EdgeRow) -> Self {
        DependencyEdge {
            id: row.id,
            parent_id: row.parent_id,
            child_id: row.child_id,
            default_strategy: row.default_strategy,
            default_parameters: row.default_parameters,
            active_from: row.active_from,
            active_to: row.active_to,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OverrideRow {
    id: Uuid,
    edge_id: Uuid,
    dimension: Option<String>,
    strategy: String,
    parameters: Value,
}

impl From<OverrideRow> for EdgeStrategyOverride {
    fn from(row: OverrideRow) -> Self {
        EdgeStrategyOverride {
            id: row.id,
            edge_id: row.edge_id,
            dimension: row.dimension,
            strategy: row.strategy,
            parameters: row.parameters,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CostRow {
    node_id: Uuid,
    cost_date: NaiveDate,
    dimension: String,
    amount: Decimal,
    currency: String,
    metadata: Value,
}

impl From<CostRow> for DailyCost {
    fn from(row: CostRow) -> Self {
        DailyCost {
            node_id: row.node_id,
            cost_date: row.cost_date,
            dimension: row.dimension,
            amount: Amount::new(row.amount),
            currency: row.currency,
            metadata: row.metadata,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UsageRow {
    node_id: Uuid,
    usage_date: NaiveDate,
    metric: String,
    value: Decimal,
    unit: String,
    labels: Value,
}

impl TryFrom<UsageRow> for DailyUsage {
    type Error = StorageError;

    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        Ok(DailyUsage {
            node_id: row.node_id,
            usage_date: row.usage_date,
            metric: row.metric,
            value: Amount::new(row.value),
            unit: row.unit,
            labels: labels_from_json(row.labels)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    window_start: NaiveDate,
    window_end: NaiveDate,
    graph_hash: Option<String>,
    status: String,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for ComputationRun {
    type Error = StorageError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(ComputationRun {
            id: row.id,
            window_start: row.window_start,
            window_end: row.window_end,
            graph_hash: row.graph_hash,
            status: parse_run_status(&row.status)?,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
