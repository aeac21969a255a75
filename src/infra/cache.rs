//! Builds cache stores and the engine from validated settings.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::cache::{
    CacheEngine, CacheStore, MemoryStore, MemoryStoreSettings, PersistentStore,
    KEY_HASH_PROPERTY, PersistentStoreSettings, RuleConfig, substrate::FsSubstrate,
};
use crate::config::{CacheSettings, RuleSettings, StoreKind, StoreSettings};

use super::error::InfraError;

/// Translate a `[[cache.rules]]` table into a rule config.
pub fn rule_config(rule: &RuleSettings) -> RuleConfig {
    let mut config = RuleConfig::new(rule.id.clone(), rule.store.clone())
        .rank(rule.rank)
        .methods(rule.methods.iter().cloned())
        .scope(rule.scope)
        .extensions(rule.extensions.iter().cloned())
        .query_params(rule.query_params.iter().cloned(), rule.allow_unlisted_query)
        .expiry(rule.expiry)
        .statuses(rule.statuses.iter().copied())
        .max_body_bytes(rule.max_body_bytes);

    for pattern in &rule.patterns {
        config = config.pattern(pattern.clone());
    }
    for header in &rule.key_headers {
        config = config.key_header(header.clone());
    }
    for header in &rule.exclude_headers {
        config = config.exclude_header(header.clone());
    }
    if let Some(header) = &rule.user_group_header {
        config = config.user_group(header.clone(), rule.anonymous_group.clone());
    }
    config
}

/// Open a persistent store on its directory. `None` for memory stores.
pub async fn open_persistent(store: &StoreSettings) -> Result<Option<PersistentStore>, InfraError> {
    let StoreKind::Persistent {
        directory,
        bucket_size,
        expected_entries,
        spool_threshold,
    } = &store.kind
    else {
        return Ok(None);
    };

    let substrate = FsSubstrate::open(directory.clone())
        .await?
        .with_index(KEY_HASH_PROPERTY);
    let mut settings = PersistentStoreSettings::new(store.name.clone(), *bucket_size, *expected_entries);
    settings.expiry = store.expiry;
    settings.spool_threshold = *spool_threshold;
    settings.capture_limit_bytes = store.capture_limit_bytes;

    let opened = PersistentStore::open(settings, Arc::new(substrate)).await?;
    info!(
        store = %store.name,
        directory = %directory.display(),
        layout = %opened.layout(),
        "persistent cache store opened"
    );
    Ok(Some(opened))
}

pub async fn open_store(store: &StoreSettings) -> Result<Arc<dyn CacheStore>, InfraError> {
    if let Some(persistent) = open_persistent(store).await? {
        return Ok(Arc::new(persistent));
    }

    let StoreKind::Memory {
        max_entries,
        max_bytes,
    } = &store.kind
    else {
        return Err(InfraError::configuration(format!(
            "store `{}` has no usable backend",
            store.name
        )));
    };

    let settings = MemoryStoreSettings {
        name: store.name.clone(),
        max_entries: *max_entries,
        max_bytes: *max_bytes,
        expiry: store.expiry,
        capture_limit_bytes: store.capture_limit_bytes,
    };
    debug!(store = %store.name, max_entries = max_entries.get(), "memory cache store created");
    Ok(Arc::new(MemoryStore::new(settings)))
}

/// Register every configured store and rule on a fresh engine.
pub async fn build_engine(cache: &CacheSettings) -> Result<Arc<CacheEngine>, InfraError> {
    let engine = Arc::new(CacheEngine::new());
    for store in &cache.stores {
        engine.register_store(open_store(store).await?);
    }
    for rule in &cache.rules {
        engine.register_config(Arc::new(rule_config(rule)));
    }
    info!(
        stores = cache.stores.len(),
        rules = cache.rules.len(),
        enabled = cache.enabled,
        "cache engine ready"
    );
    Ok(engine)
}

/// Sweep expired entries from every store on a fixed cadence.
pub fn spawn_purge_task(engine: Arc<CacheEngine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = engine.purge_expired().await;
            if purged > 0 {
                debug!(purged, "expired cache entries purged");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use axum::http::{HeaderName, Method, StatusCode};

    use super::*;
    use crate::cache::{CacheConfig, CacheRequest, ExpiryPolicy, KeyExpiry, RequestScope, ScopeFilter};

    fn rule_settings() -> RuleSettings {
        RuleSettings {
            id: "docs".to_string(),
            store: "memory".to_string(),
            rank: 3,
            patterns: vec!["/docs/**".to_string()],
            methods: vec![Method::GET],
            scope: ScopeFilter::Request,
            extensions: vec!["html".to_string()],
            query_params: vec!["page".to_string()],
            allow_unlisted_query: false,
            key_headers: Vec::new(),
            user_group_header: Some(HeaderName::from_static("x-user-group")),
            anonymous_group: Some("anonymous".to_string()),
            expiry: KeyExpiry {
                creation: Some(Duration::from_secs(60)),
                ..Default::default()
            },
            exclude_headers: vec![HeaderName::from_static("x-request-id")],
            statuses: vec![StatusCode::OK],
            max_body_bytes: Some(1024),
        }
    }

    #[test]
    fn rule_settings_become_rule_configs() {
        let rule = rule_config(&rule_settings());
        assert_eq!(rule.id(), "docs");
        assert_eq!(CacheConfig::rank(&rule), 3);
        assert_eq!(CacheConfig::max_body_bytes(&rule), Some(1024));
        assert!(rule.accepts(&CacheRequest::get("/docs/intro.html?page=2"), RequestScope::Request));
        assert!(!rule.accepts(&CacheRequest::get("/blog/intro.html"), RequestScope::Request));

        let key = rule
            .build_key(&CacheRequest::get("/docs/intro.html"))
            .expect("key");
        assert_eq!(key.component("group"), Some(&["anonymous".to_string()][..]));
        assert_eq!(key.expiry_for_creation(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn engine_registers_memory_and_persistent_stores() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache = CacheSettings {
            enabled: true,
            purge_interval: Duration::from_secs(60),
            stores: vec![
                StoreSettings {
                    name: "memory".to_string(),
                    kind: StoreKind::Memory {
                        max_entries: NonZeroUsize::new(10).expect("non-zero"),
                        max_bytes: None,
                    },
                    expiry: ExpiryPolicy::default(),
                    capture_limit_bytes: None,
                },
                StoreSettings {
                    name: "disk".to_string(),
                    kind: StoreKind::Persistent {
                        directory: dir.path().join("disk"),
                        bucket_size: 3,
                        expected_entries: 7,
                        spool_threshold: 1024,
                    },
                    expiry: ExpiryPolicy::default(),
                    capture_limit_bytes: None,
                },
            ],
            rules: vec![rule_settings()],
        };

        let engine = build_engine(&cache).await.expect("engine");
        let names: Vec<String> = engine.stores().iter().map(|store| store.name().to_string()).collect();
        assert_eq!(names, ["disk", "memory"]);
        assert!(engine.config("docs").is_some());

        let disk = open_persistent(&cache.stores[1]).await.expect("open").expect("persistent");
        assert_eq!(disk.layout().depth(), 1);
        assert!(open_persistent(&cache.stores[0]).await.expect("open").is_none());
    }
}
