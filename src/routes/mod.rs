pub mod plan_routes;
pub mod tenant_routes;

use crate::state::SharedState;
use axum::{
    http::{header, Method},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn app(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(std::time::Duration::from_secs(3600));

    let api = Router::new()
        // Tenants
        .route(
            "/tenants",
            get(tenant_routes::list_tenants).post(tenant_routes::create_tenant),
        )
        .route(
            "/tenants/{id}",
            get(tenant_routes::get_tenant).delete(tenant_routes::delete_tenant),
        )
        .route("/tenants/{id}/start", post(tenant_routes::start_tenant))
        .route("/tenants/{id}/stop", post(tenant_routes::stop_tenant))
        .route("/tenants/{id}/restart", post(tenant_routes::restart_tenant))
        .route(
            "/tenants/{id}/recreate",
            post(tenant_routes::recreate_tenant),
        )
        .route("/tenants/{id}/sync", post(tenant_routes::sync_tenant))
        .route("/tenants/{id}/status", get(tenant_routes::tenant_status))
        .route("/tenants/{id}/logs", get(tenant_routes::tenant_logs))
        // Plans
        .route(
            "/plans",
            get(plan_routes::list_plans).post(plan_routes::upsert_plan),
        )
        .route(
            "/plans/{name}",
            get(plan_routes::get_plan).delete(plan_routes::delete_plan),
        )
        .with_state(state);

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tenantd"
    }))
}
