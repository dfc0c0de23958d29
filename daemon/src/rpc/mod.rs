pub mod error;
pub mod rpc;

use std::sync::Arc;

use actix_web::{
    web::{self, Data},
    App, HttpServer,
};
use anyhow::Context;

use crate::core::storage::Storage;

pub struct AppState<S: Storage> {
    pub storage: Arc<S>,
}

pub fn register_routes<S: Storage>(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(rpc::health::<S>)).service(
        web::scope("/api/v1")
            .route("/products", web::get().to(rpc::get_products::<S>))
            .route("/nodes", web::get().to(rpc::get_nodes::<S>))
            .route("/nodes/{id}/metrics", web::get().to(rpc::get_node_metrics::<S>))
            .route("/costs/by-type", web::get().to(rpc::get_costs_by_type::<S>))
            .route(
                "/costs/by-dimension",
                web::get().to(rpc::get_costs_by_dimension::<S>),
            )
            .route(
                "/recommendations",
                web::get().to(rpc::get_recommendations::<S>),
            )
            .route("/dashboard", web::get().to(rpc::get_dashboard::<S>))
            .route("/runs", web::get().to(rpc::list_runs::<S>))
            .route("/runs/{id}", web::get().to(rpc::get_run::<S>)),
    );
}

/// Serve the read API until the process is asked to stop.
pub async fn run_rpc_server<S: Storage>(storage: Arc<S>, bind_address: &str) -> anyhow::Result<()> {
    info!("starting read API on {}", bind_address);
    let state = Data::new(AppState { storage });
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(error::query_config())
            .configure(register_routes::<S>)
    })
    .bind(bind_address)
    .with_context(|| format!("cannot bind read API to {}", bind_address))?
    .run()
    .await
    .context("read API server terminated abnormally")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        engine::{AllocationEngine, RunRequest},
        storage::MemoryStorage,
    };
    use actix_web::{http::StatusCode, test};
    use chrono::{NaiveDate, Utc};
    use costwise_common::{
        amount::Amount,
        api::{HealthResponse, ProductsResponse},
        model::{CostNode, DailyCost, DependencyEdge, NodeType},
    };
    use serde_json::Value;
    use uuid::Uuid;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
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

    async fn seeded_storage() -> Arc<MemoryStorage> {
        let resource = create_test_node("vm-fleet", NodeType::Resource);
        let product = create_test_node("checkout", NodeType::Product);
        let edge = DependencyEdge {
            id: Uuid::new_v4(),
            parent_id: resource.id,
            child_id: product.id,
            default_strategy: "equal".to_string(),
            default_parameters: Value::Null,
            active_from: date("2024-01-01"),
            active_to: None,
        };
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_graph(vec![resource.clone(), product], vec![edge], Vec::new())
            .await;
        storage
            .seed_costs(vec![DailyCost {
                node_id: resource.id,
                cost_date: date("2024-01-01"),
                dimension: "compute_hours".to_string(),
                amount: Amount::from(100i64),
                currency: "USD".to_string(),
                metadata: Value::Null,
            }])
            .await;

        let engine = AllocationEngine::new(storage.clone());
        engine
            .execute(RunRequest {
                window_start: date("2024-01-01"),
                window_end: date("2024-01-01"),
                dimensions: None,
                notes: None,
            })
            .await
            .unwrap();
        storage
    }

    #[actix_web::test]
    async fn test_health_endpoint() {
        let storage = Arc::new(MemoryStorage::new());
        let app = test::init_service(
            App::new()
                .app_data(Data::new(AppState { storage }))
                .app_data(error::query_config())
                .configure(register_routes::<MemoryStorage>),
        )
        .await;

        let response = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: HealthResponse = test::read_body_json(response).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.database, "connected");
    }

    #[actix_web::test]
    async fn test_products_returns_allocated_totals() {
        let storage = seeded_storage().await;
        let app = test::init_service(
            App::new()
                .app_data(Data::new(AppState { storage }))
                .app_data(error::query_config())
                .configure(register_routes::<MemoryStorage>),
        )
        .await;

        let response = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/products?start_date=2024-01-01&end_date=2024-01-01&currency=USD")
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: ProductsResponse = test::read_body_json(response).await;
        assert_eq!(body.products.len(), 1);
        assert_eq!(body.products[0].name, "checkout");
        assert_eq!(body.products[0].total_amount, Amount::from(100i64));
        assert_eq!(body.coverage.coverage_percent, Amount::from(100i64));
    }

    #[actix_web::test]
    async fn test_products_without_completed_run_is_404() {
        let storage = Arc::new(MemoryStorage::new());
        let app = test::init_service(
            App::new()
                .app_data(Data::new(AppState { storage }))
                .app_data(error::query_config())
                .configure(register_routes::<MemoryStorage>),
        )
        .await;

        let response = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/products?start_date=2024-01-01&end_date=2024-01-01&currency=USD")
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_missing_parameters_are_400() {
        let storage = Arc::new(MemoryStorage::new());
        let app = test::init_service(
            App::new()
                .app_data(Data::new(AppState { storage }))
                .app_data(error::query_config())
                .configure(register_routes::<MemoryStorage>),
        )
        .await;

        let response = test::call_service(
            &app,
            test::TestRequest::get().uri("/api/v1/products").to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_inverted_range_is_400() {
        let storage = seeded_storage().await;
        let app = test::init_service(
            App::new()
                .app_data(Data::new(AppState { storage }))
                .app_data(error::query_config())
                .configure(register_routes::<MemoryStorage>),
        )
        .await;

        let response = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/products?start_date=2024-02-01&end_date=2024-01-01&currency=USD")
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_unknown_node_is_404_and_malformed_id_is_400() {
        let storage = seeded_storage().await;
        let app = test::init_service(
            App::new()
                .app_data(Data::new(AppState { storage }))
                .app_data(error::query_config())
                .configure(register_routes::<MemoryStorage>),
        )
        .await;

        let missing = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!(
                    "/api/v1/nodes/{}/metrics?start_date=2024-01-01&end_date=2024-01-01&currency=USD",
                    Uuid::new_v4()
                ))
                .to_request(),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let malformed = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/nodes/not-a-uuid/metrics?start_date=2024-01-01&end_date=2024-01-01&currency=USD")
                .to_request(),
        )
        .await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    }
}
