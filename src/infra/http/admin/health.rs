use axum::{extract::State, http::StatusCode};

use super::AdminState;

/// Healthy once at least one store is registered.
pub(super) async fn admin_health(State(state): State<AdminState>) -> StatusCode {
    if state.engine.stores().is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::NO_CONTENT
    }
}
