//! HTTP read API handlers.
//!
//! Every cost query resolves "the single most recent completed run whose
//! window covers the requested range" first and stays inside that run;
//! in-flight runs are never visible here. Amounts leave as decimal strings.

use std::str::FromStr;

use actix_web::{
    web::{Data, Path, Query},
    HttpResponse,
};
use chrono::{NaiveDate, Utc};
use costwise_common::{
    api::{
        ByDimensionParams, CostsByDimensionResponse, CostsByTypeResponse, DashboardResponse,
        HealthResponse, NodeMetricsResponse, NodesParams, NodesResponse, ProductsParams,
        ProductsResponse, RangeParams, RecommendationsResponse, RunsParams,
    },
    model::{ComputationRun, NodeType},
};
use uuid::Uuid;

use super::{error::ApiError, AppState};
use crate::{
    config::{
        idle_resource_cost_floor, invariant_tolerance, DASHBOARD_TOP_PRODUCTS,
        DEFAULT_QUERY_LIMIT, DEFAULT_RUN_LIST_LIMIT, MAX_QUERY_LIMIT,
    },
    core::storage::Storage,
};

fn validate_range(start: NaiveDate, end: NaiveDate, currency: &str) -> Result<(), ApiError> {
    if start > end {
        return Err(ApiError::InvalidRequest(format!(
            "start_date {} is after end_date {}",
            start, end
        )));
    }
    if currency.trim().is_empty() {
        return Err(ApiError::InvalidRequest(
            "currency must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn clamp_limit(limit: Option<i64>) -> Result<i64, ApiError> {
    match limit {
        None => Ok(DEFAULT_QUERY_LIMIT),
        Some(value) if value > 0 => Ok(value.min(MAX_QUERY_LIMIT)),
        Some(value) => Err(ApiError::InvalidRequest(format!(
            "limit must be positive, got {}",
            value
        ))),
    }
}

fn clamp_offset(offset: Option<i64>) -> Result<i64, ApiError> {
    match offset {
        None => Ok(0),
        Some(value) if value >= 0 => Ok(value),
        Some(value) => Err(ApiError::InvalidRequest(format!(
            "offset must not be negative, got {}",
            value
        ))),
    }
}

async fn resolve_run<S: Storage>(
    state: &AppState<S>,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<ComputationRun, ApiError> {
    state
        .storage
        .latest_completed_run(start, end)
        .await?
        .ok_or(ApiError::NoCompletedRun { start, end })
}

pub async fn get_products<S: Storage>(
    state: Data<AppState<S>>,
    query: Query<ProductsParams>,
) -> Result<HttpResponse, ApiError> {
    let params = query.into_inner();
    validate_range(params.start_date, params.end_date, &params.currency)?;
    let limit = clamp_limit(params.limit)?;
    let offset = clamp_offset(params.offset)?;

    let run = resolve_run(&state, params.start_date, params.end_date).await?;
    let products = state
        .storage
        .sum_costs_by_node(
            &run.id,
            params.start_date,
            params.end_date,
            Some(NodeType::Product),
            limit,
            offset,
        )
        .await?;
    let coverage = state
        .storage
        .coverage(&run.id, params.start_date, params.end_date)
        .await?;

    Ok(HttpResponse::Ok().json(ProductsResponse {
        products,
        coverage,
        currency: params.currency,
    }))
}

pub async fn get_nodes<S: Storage>(
    state: Data<AppState<S>>,
    query: Query<NodesParams>,
) -> Result<HttpResponse, ApiError> {
    let params = query.into_inner();
    validate_range(params.start_date, params.end_date, &params.currency)?;
    let limit = clamp_limit(params.limit)?;
    let offset = clamp_offset(params.offset)?;
    let node_type = params
        .node_type
        .as_deref()
        .map(|raw| {
            NodeType::from_str(raw)
                .map_err(|_| ApiError::InvalidRequest(format!("unknown node type '{}'", raw)))
        })
        .transpose()?;

    let run = resolve_run(&state, params.start_date, params.end_date).await?;
    let nodes = state
        .storage
        .sum_costs_by_node(
            &run.id,
            params.start_date,
            params.end_date,
            node_type,
            limit,
            offset,
        )
        .await?;

    Ok(HttpResponse::Ok().json(NodesResponse {
        nodes,
        currency: params.currency,
    }))
}

pub async fn get_costs_by_type<S: Storage>(
    state: Data<AppState<S>>,
    query: Query<RangeParams>,
) -> Result<HttpResponse, ApiError> {
    let params = query.into_inner();
    validate_range(params.start_date, params.end_date, &params.currency)?;

    let run = resolve_run(&state, params.start_date, params.end_date).await?;
    let types = state
        .storage
        .costs_by_type(&run.id, params.start_date, params.end_date)
        .await?;

    Ok(HttpResponse::Ok().json(CostsByTypeResponse {
        types,
        currency: params.currency,
    }))
}

pub async fn get_costs_by_dimension<S: Storage>(
    state: Data<AppState<S>>,
    query: Query<ByDimensionParams>,
) -> Result<HttpResponse, ApiError> {
    let params = query.into_inner();
    validate_range(params.start_date, params.end_date, &params.currency)?;
    if params.key.trim().is_empty() {
        return Err(ApiError::InvalidRequest("key must not be empty".to_string()));
    }

    let run = resolve_run(&state, params.start_date, params.end_date).await?;
    let groups = state
        .storage
        .costs_by_label(&run.id, params.start_date, params.end_date, &params.key)
        .await?;

    Ok(HttpResponse::Ok().json(CostsByDimensionResponse {
        key: params.key,
        groups,
        currency: params.currency,
    }))
}

pub async fn get_node_metrics<S: Storage>(
    state: Data<AppState<S>>,
    path: Path<String>,
    query: Query<RangeParams>,
) -> Result<HttpResponse, ApiError> {
    let params = query.into_inner();
    validate_range(params.start_date, params.end_date, &params.currency)?;
    let node_id = Uuid::parse_str(&path.into_inner())
        .map_err(|_| ApiError::InvalidRequest("malformed node id".to_string()))?;

    // 404 for an id that does not exist, independent of run scoping
    let node = state.storage.get_node_by_id(&node_id).await?;
    let run = resolve_run(&state, params.start_date, params.end_date).await?;

    let costs = state
        .storage
        .node_cost_series(&run.id, &node_id, params.start_date, params.end_date)
        .await?;
    let usage = state
        .storage
        .node_usage_series(&node_id, params.start_date, params.end_date)
        .await?;

    Ok(HttpResponse::Ok().json(NodeMetricsResponse {
        id: node.id,
        name: node.name,
        costs,
        usage,
        currency: params.currency,
    }))
}

pub async fn get_recommendations<S: Storage>(
    state: Data<AppState<S>>,
    query: Query<RangeParams>,
) -> Result<HttpResponse, ApiError> {
    let params = query.into_inner();
    validate_range(params.start_date, params.end_date, &params.currency)?;

    let run = resolve_run(&state, params.start_date, params.end_date).await?;
    let (residuals, idle) = tokio::try_join!(
        state.storage.unallocated_residuals(
            &run.id,
            params.start_date,
            params.end_date,
            invariant_tolerance(),
        ),
        state.storage.idle_resources(
            &run.id,
            params.start_date,
            params.end_date,
            idle_resource_cost_floor(),
        ),
    )?;

    let mut recommendations = residuals;
    recommendations.extend(idle);
    recommendations.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.node_id.cmp(&b.node_id)));

    Ok(HttpResponse::Ok().json(RecommendationsResponse {
        recommendations,
        currency: params.currency,
    }))
}

pub async fn get_dashboard<S: Storage>(
    state: Data<AppState<S>>,
    query: Query<RangeParams>,
) -> Result<HttpResponse, ApiError> {
    let params = query.into_inner();
    validate_range(params.start_date, params.end_date, &params.currency)?;

    let run = resolve_run(&state, params.start_date, params.end_date).await?;
    let (start, end) = (params.start_date, params.end_date);
    let storage = &state.storage;
    let (top_products, platform_nodes, resource_nodes, shared_nodes, costs_by_type) = tokio::try_join!(
        storage.sum_costs_by_node(
            &run.id,
            start,
            end,
            Some(NodeType::Product),
            DASHBOARD_TOP_PRODUCTS,
            0
        ),
        storage.sum_costs_by_node(&run.id, start, end, Some(NodeType::Platform), MAX_QUERY_LIMIT, 0),
        storage.sum_costs_by_node(&run.id, start, end, Some(NodeType::Resource), MAX_QUERY_LIMIT, 0),
        storage.sum_costs_by_node(&run.id, start, end, Some(NodeType::Shared), MAX_QUERY_LIMIT, 0),
        storage.costs_by_type(&run.id, start, end),
    )?;

    Ok(HttpResponse::Ok().json(DashboardResponse {
        top_products,
        platform_nodes,
        resource_nodes,
        shared_nodes,
        costs_by_type,
        currency: params.currency,
    }))
}

pub async fn list_runs<S: Storage>(
    state: Data<AppState<S>>,
    query: Query<RunsParams>,
) -> Result<HttpResponse, ApiError> {
    let limit = match query.into_inner().limit {
        None => DEFAULT_RUN_LIST_LIMIT,
        Some(value) if value > 0 => value.min(MAX_QUERY_LIMIT),
        Some(value) => {
            return Err(ApiError::InvalidRequest(format!(
                "limit must be positive, got {}",
                value
            )))
        }
    };
    let runs = state.storage.list_runs(limit).await?;
    Ok(HttpResponse::Ok().json(runs))
}

pub async fn get_run<S: Storage>(
    state: Data<AppState<S>>,
    path: Path<String>,
) -> Result<HttpResponse, ApiError> {
    let run_id = Uuid::parse_str(&path.into_inner())
        .map_err(|_| ApiError::InvalidRequest("malformed run id".to_string()))?;
    let run = state.storage.get_run(&run_id).await?;
    Ok(HttpResponse::Ok().json(run))
}

pub async fn health<S: Storage>(state: Data<AppState<S>>) -> HttpResponse {
    let database_up = state.storage.ping().await.is_ok();
    HttpResponse::Ok().json(HealthResponse {
        status: if database_up { "ok" } else { "degraded" }.to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if database_up {
            "connected"
        } else {
            "disconnected"
        }
        .to_string(),
    })
}
