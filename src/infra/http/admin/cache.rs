use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::cache::AdminError;

use super::super::error::HttpError;
use super::AdminState;

#[derive(Debug, Serialize)]
struct Invalidated {
    invalidated: usize,
}

fn admin_error(source: &'static str, error: AdminError) -> Response {
    match error {
        AdminError::UnknownStore(_) => {
            HttpError::from_error(source, StatusCode::NOT_FOUND, "Unknown cache store", &error)
                .into_response()
        }
    }
}

pub(super) async fn cache_stats(State(state): State<AdminState>) -> Response {
    Json(state.cache.stats()).into_response()
}

pub(super) async fn store_stats(
    State(state): State<AdminState>,
    Path(store): Path<String>,
) -> Response {
    match state.cache.store_stats(&store) {
        Ok(stats) => Json(stats).into_response(),
        Err(error) => admin_error("infra::http::admin::cache::store_stats", error),
    }
}

pub(super) async fn list_entries(
    State(state): State<AdminState>,
    Path(store): Path<String>,
) -> Response {
    match state.cache.keys(&store).await {
        Ok(keys) => Json(keys).into_response(),
        Err(error) => admin_error("infra::http::admin::cache::list_entries", error),
    }
}

pub(super) async fn show_entry(
    State(state): State<AdminState>,
    Path((store, hash)): Path<(String, String)>,
) -> Response {
    match state.cache.entry(&store, &hash).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => HttpError::new(
            "infra::http::admin::cache::show_entry",
            StatusCode::NOT_FOUND,
            "Unknown cache entry",
            format!("no entry `{hash}` in store `{store}`"),
        )
        .into_response(),
        Err(error) => admin_error("infra::http::admin::cache::show_entry", error),
    }
}

pub(super) async fn delete_entry(
    State(state): State<AdminState>,
    Path((store, hash)): Path<(String, String)>,
) -> Response {
    match state.cache.invalidate_entry(&store, &hash).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => HttpError::new(
            "infra::http::admin::cache::delete_entry",
            StatusCode::NOT_FOUND,
            "Unknown cache entry",
            format!("no entry `{hash}` in store `{store}`"),
        )
        .into_response(),
        Err(error) => admin_error("infra::http::admin::cache::delete_entry", error),
    }
}

pub(super) async fn clear_all(State(state): State<AdminState>) -> Response {
    match state.cache.clear_cache(None).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => admin_error("infra::http::admin::cache::clear_all", error),
    }
}

pub(super) async fn clear_store(
    State(state): State<AdminState>,
    Path(store): Path<String>,
) -> Response {
    match state.cache.clear_cache(Some(&store)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => admin_error("infra::http::admin::cache::clear_store", error),
    }
}

pub(super) async fn invalidate_config(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Response {
    match state.engine.invalidate_config(&id).await {
        Some(invalidated) => Json(Invalidated { invalidated }).into_response(),
        None => HttpError::new(
            "infra::http::admin::cache::invalidate_config",
            StatusCode::NOT_FOUND,
            "Unknown cache config",
            format!("no config `{id}` is registered"),
        )
        .into_response(),
    }
}
