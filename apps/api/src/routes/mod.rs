pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::applications::handlers as applications;
use crate::assist::handlers as assist;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Application API
        .route(
            "/api/v1/applications",
            post(applications::handle_submit).get(applications::handle_list),
        )
        .route(
            "/api/v1/applications/stats",
            get(applications::handle_stats),
        )
        .route("/api/v1/applications/:id", get(applications::handle_get))
        .route(
            "/api/v1/applications/:id/cancel",
            post(applications::handle_cancel),
        )
        .route(
            "/api/v1/applications/:id/events",
            get(applications::handle_events),
        )
        // Worker assist API
        .route("/api/v1/assist/queue", get(assist::handle_list_queue))
        .route(
            "/api/v1/assist/queue/start-next",
            post(assist::handle_start_next),
        )
        .route(
            "/api/v1/assist/sessions/:id/complete",
            post(assist::handle_complete),
        )
        .route(
            "/api/v1/assist/sessions/:id/fail",
            post(assist::handle_fail),
        )
        .route(
            "/api/v1/assist/sessions/:id/skip",
            post(assist::handle_skip),
        )
        .route("/api/v1/assist/stats", get(assist::handle_worker_stats))
        .route(
            "/api/v1/assist/leaderboard",
            get(assist::handle_leaderboard),
        )
        // Admin API
        .route(
            "/api/v1/admin/workers",
            post(assist::handle_provision_worker),
        )
        .route(
            "/api/v1/admin/assist-sessions",
            post(assist::handle_admin_enqueue),
        )
        .with_state(state)
}
