mod cache;
mod health;
mod state;

pub use state::AdminState;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use super::middleware::{log_responses, set_request_context};

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/_health", get(health::admin_health))
        .route("/cache/stats", get(cache::cache_stats))
        .route("/cache/clear", post(cache::clear_all))
        .route("/cache/stores/{store}/stats", get(cache::store_stats))
        .route("/cache/stores/{store}/clear", post(cache::clear_store))
        .route("/cache/stores/{store}/entries", get(cache::list_entries))
        .route(
            "/cache/stores/{store}/entries/{hash}",
            get(cache::show_entry).delete(cache::delete_entry),
        )
        .route(
            "/cache/configs/{id}/invalidate",
            post(cache::invalidate_config),
        )
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}
