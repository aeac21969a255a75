use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::{
    cache::{CacheState, response_cache_layer},
    infra::content::ContentOrigin,
};

use super::{
    error::HttpError,
    middleware::{log_responses, mark_include_scope, set_request_context},
};

#[derive(Clone)]
pub struct HttpState {
    pub origin: Arc<ContentOrigin>,
    pub cache: Option<CacheState>,
}

pub fn build_router(state: HttpState) -> Router {
    // Everything under the origin goes through the cache layer
    let cached_routes = Router::new().fallback(serve_content);

    let cached_routes = if let Some(cache_state) = state.cache.clone() {
        cached_routes.layer(middleware::from_fn_with_state(
            cache_state,
            response_cache_layer,
        ))
    } else {
        cached_routes
    };

    let uncached_routes = Router::new().route("/_health", get(public_health));

    uncached_routes
        .merge(cached_routes)
        .with_state(state)
        .layer(middleware::from_fn(mark_include_scope))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn public_health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn serve_content(State(state): State<HttpState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return HttpError::new(
            "infra::http::public::serve_content",
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed",
            format!("{method} is not served by the content origin"),
        )
        .into_response();
    }

    match state.origin.load(uri.path()).await {
        Ok(Some(file)) => file.into_response(),
        Ok(None) => HttpError::new(
            "infra::http::public::serve_content",
            StatusCode::NOT_FOUND,
            "Not found",
            format!("no content at `{}`", uri.path()),
        )
        .into_response(),
        Err(status) => HttpError::new(
            "infra::http::public::serve_content",
            status,
            "Request rejected",
            format!("content request for `{}` rejected", uri.path()),
        )
        .into_response(),
    }
}
