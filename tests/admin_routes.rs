use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    middleware,
    routing::get,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::Value;
use strata::{
    cache::{
        CacheEngine, CacheState, CacheStore, MemoryStore, MemoryStoreSettings, RuleConfig,
        response_cache_layer,
    },
    infra::http::{AdminState, build_admin_router},
};
use tower::ServiceExt;

struct Harness {
    store: Arc<MemoryStore>,
    public: Router,
    admin: Router,
}

fn harness() -> Harness {
    let engine = Arc::new(CacheEngine::new());
    let store = Arc::new(MemoryStore::new(MemoryStoreSettings::new("memory", 16)));
    engine.register_store(store.clone());
    engine.register_config(Arc::new(RuleConfig::new("pages", "memory").pattern("/*")));

    let public = Router::new()
        .route("/a", get(|| async { "hello" }))
        .route("/b", get(|| async { "world" }))
        .layer(middleware::from_fn_with_state(
            CacheState::new(Arc::clone(&engine)),
            response_cache_layer,
        ));
    let admin = build_admin_router(AdminState::new(engine));

    Harness {
        store,
        public,
        admin,
    }
}

async fn send(router: &Router, method: Method, uri: &str) -> (StatusCode, Bytes) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, body)
}

fn json(body: &Bytes) -> Value {
    serde_json::from_slice(body).expect("json body")
}

async fn warm(harness: &Harness) {
    for uri in ["/a", "/b"] {
        let (status, _) = send(&harness.public, Method::GET, uri).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn stats_and_entry_listing_reflect_the_store() {
    let harness = harness();
    warm(&harness).await;

    let (status, body) = send(&harness.admin, Method::GET, "/cache/stats").await;
    assert_eq!(status, StatusCode::OK);
    let stats = json(&body);
    assert_eq!(stats[0]["store"], "memory");
    assert_eq!(stats[0]["entries"], 2);
    assert_eq!(stats[0]["puts"], 2);

    let (status, body) = send(&harness.admin, Method::GET, "/cache/stores/memory/entries").await;
    assert_eq!(status, StatusCode::OK);
    let entries = json(&body);
    let entries = entries.as_array().expect("array");
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|entry| entry["config"] == "pages"));

    let hash = entries[0]["hash"].as_str().expect("hash");
    let (status, body) = send(
        &harness.admin,
        Method::GET,
        &format!("/cache/stores/memory/entries/{hash}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entry = json(&body);
    assert_eq!(entry["status"], 200);
    assert_eq!(entry["body_len"], 5);

    // Inspection is not an access.
    assert_eq!(harness.store.stats().hits, 0);
}

#[tokio::test]
async fn entries_can_be_deleted_and_stores_cleared() {
    let harness = harness();
    warm(&harness).await;

    let (_, body) = send(&harness.admin, Method::GET, "/cache/stores/memory/entries").await;
    let hash = json(&body)[0]["hash"]
        .as_str()
        .expect("hash")
        .to_string();

    let uri = format!("/cache/stores/memory/entries/{hash}");
    let (status, _) = send(&harness.admin, Method::DELETE, &uri).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(harness.store.size().await, 1);

    let (status, _) = send(&harness.admin, Method::DELETE, &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&harness.admin, Method::POST, "/cache/stores/memory/clear").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(harness.store.size().await, 0);

    warm(&harness).await;
    let (status, _) = send(&harness.admin, Method::POST, "/cache/clear").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(harness.store.size().await, 0);
}

#[tokio::test]
async fn unknown_targets_are_not_found() {
    let harness = harness();

    for (method, uri) in [
        (Method::GET, "/cache/stores/disk/entries"),
        (Method::GET, "/cache/stores/disk/stats"),
        (Method::POST, "/cache/stores/disk/clear"),
        (Method::GET, "/cache/stores/memory/entries/deadbeef"),
        (Method::POST, "/cache/configs/missing/invalidate"),
    ] {
        let (status, _) = send(&harness.admin, method, uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn health_reports_registered_stores() {
    let harness = harness();
    let (status, _) = send(&harness.admin, Method::GET, "/_health").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let empty = build_admin_router(AdminState::new(Arc::new(CacheEngine::new())));
    let (status, _) = send(&empty, Method::GET, "/_health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
