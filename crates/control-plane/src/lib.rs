//! Control plane
//!
//! Simulates the lifecycle of image builds and deployments, keeps their
//! runtime telemetry in memory and serves both over a REST API with
//! role-based access control.

pub mod config;
pub mod control;
pub mod handlers;
pub mod hooks;
pub mod models;
pub mod random;
pub mod requests;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
pub mod users;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::{Config, StoreBackend};
pub use handlers::AppState;
pub use random::{RandomSource, ScriptedRandom, StdRandom};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use storage::{MemoryStore, RedisStore, Store};
pub use telemetry::TelemetryStore;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/hooks/commit", post(handlers::commit_hook_handler))
        .route(
            "/api/admin/users",
            get(handlers::list_users_handler).post(handlers::create_user_handler),
        )
        .route("/api/admin/users/{id}/block", post(handlers::block_user_handler))
        .route(
            "/api/admin/users/{id}/unblock",
            post(handlers::unblock_user_handler),
        )
        .route("/api/admin/audit", get(handlers::audit_handler))
        .route("/api/alerts", get(handlers::alerts_handler))
        .route(
            "/api/requests",
            get(handlers::list_requests_handler).post(handlers::create_request_handler),
        )
        .route(
            "/api/requests/{id}",
            get(handlers::get_request_handler).put(handlers::edit_request_handler),
        )
        .route(
            "/api/requests/{id}/submit",
            post(handlers::submit_request_handler),
        )
        .route(
            "/api/requests/{id}/status",
            post(handlers::change_request_status_handler),
        )
        .route(
            "/api/requests/{id}/builds",
            post(handlers::queue_build_handler),
        )
        .route("/api/builds/{id}/log", get(handlers::build_log_handler))
        .route(
            "/api/images/{id}/deployments",
            post(handlers::create_deployment_handler),
        )
        .route("/api/deployments", get(handlers::list_deployments_handler))
        .route(
            "/api/deployments/{id}",
            get(handlers::get_deployment_handler).delete(handlers::delete_deployment_handler),
        )
        .route(
            "/api/deployments/{id}/start",
            post(handlers::start_deployment_handler),
        )
        .route(
            "/api/deployments/{id}/stop",
            post(handlers::stop_deployment_handler),
        )
        .route(
            "/api/deployments/{id}/restart",
            post(handlers::restart_deployment_handler),
        )
        .route(
            "/api/deployments/{id}/logs",
            get(handlers::deployment_logs_handler),
        )
        .route(
            "/api/deployments/{id}/logs/stream",
            get(handlers::deployment_log_stream_handler),
        )
        .route(
            "/api/deployments/{id}/metrics",
            get(handlers::deployment_metrics_handler),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
