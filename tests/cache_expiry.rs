use std::sync::Arc;
use std::time::Duration;

use axum::{Router, body::Body, http::Request, middleware, routing::get};
use http_body_util::BodyExt;
use strata::cache::{
    CacheEngine, CachePhase, CacheState, CacheStore, ExpiryPolicy, KeyExpiry, MemoryStore,
    MemoryStoreSettings, RuleConfig, response_cache_layer,
};
use tower::ServiceExt;

fn app(engine: Arc<CacheEngine>) -> Router {
    Router::new()
        .route("/a", get(|| async { "hello" }))
        .route("/b", get(|| async { "world" }))
        .layer(middleware::from_fn_with_state(
            CacheState::new(engine),
            response_cache_layer,
        ))
}

async fn phase_of(app: &Router, uri: &str) -> Option<CachePhase> {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let phase = response.extensions().get::<CachePhase>().copied();
    response.into_body().collect().await.expect("body");
    phase
}

#[tokio::test(start_paused = true)]
async fn rule_creation_ttl_expires_entries() {
    let engine = Arc::new(CacheEngine::new());
    engine.register_store(Arc::new(MemoryStore::new(MemoryStoreSettings::new("memory", 8))));
    engine.register_config(Arc::new(
        RuleConfig::new("short", "memory")
            .pattern("/a")
            .expiry(KeyExpiry {
                creation: Some(Duration::from_secs(1)),
                ..KeyExpiry::default()
            }),
    ));
    let app = app(Arc::clone(&engine));

    assert_eq!(phase_of(&app, "/a").await, Some(CachePhase::Capturing));
    assert_eq!(phase_of(&app, "/a").await, Some(CachePhase::Delivered));

    tokio::time::advance(Duration::from_millis(1_001)).await;
    assert_eq!(phase_of(&app, "/a").await, Some(CachePhase::Capturing));
    assert_eq!(phase_of(&app, "/a").await, Some(CachePhase::Delivered));
}

#[tokio::test(start_paused = true)]
async fn purge_sweeps_store_default_ttl() {
    let mut settings = MemoryStoreSettings::new("memory", 8);
    settings.expiry = ExpiryPolicy {
        ttl: Some(Duration::from_secs(5)),
        ..ExpiryPolicy::default()
    };
    let store = Arc::new(MemoryStore::new(settings));
    let engine = Arc::new(CacheEngine::new());
    engine.register_store(store.clone());
    engine.register_config(Arc::new(RuleConfig::new("all", "memory").pattern("/*")));
    let app = app(Arc::clone(&engine));

    phase_of(&app, "/a").await;
    tokio::time::advance(Duration::from_secs(3)).await;
    phase_of(&app, "/b").await;
    assert_eq!(store.size().await, 2);

    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(engine.purge_expired().await, 1);
    assert_eq!(store.size().await, 1);
    assert_eq!(phase_of(&app, "/b").await, Some(CachePhase::Delivered));
}
