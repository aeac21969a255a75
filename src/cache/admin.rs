//! Administrative facade over the engine's stores.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::content::StoredHeaderValue;
use super::engine::CacheEngine;
use super::keys::CacheKey;
use super::stats::StatsSnapshot;
use super::store::CacheStore;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdminError {
    #[error("unknown cache store `{0}`")]
    UnknownStore(String),
}

/// One line of a store's key listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub hash: String,
    pub key: String,
    pub config: String,
}

impl From<&CacheKey> for EntrySummary {
    fn from(key: &CacheKey) -> Self {
        Self {
            hash: key.hash_hex().to_string(),
            key: key.raw().to_string(),
            config: key.config_id().to_string(),
        }
    }
}

/// Stored entry as shown to operators. The body itself is not included.
#[derive(Debug, Clone, Serialize)]
pub struct EntryView {
    #[serde(flatten)]
    pub summary: EntrySummary,
    pub status: u16,
    pub content_type: Option<String>,
    pub character_encoding: Option<String>,
    pub headers: Vec<(String, Vec<String>)>,
    pub body_len: u64,
}

#[derive(Clone)]
pub struct CacheAdmin {
    engine: Arc<CacheEngine>,
}

impl CacheAdmin {
    pub fn new(engine: Arc<CacheEngine>) -> Self {
        Self { engine }
    }

    fn store(&self, name: &str) -> Result<Arc<dyn CacheStore>, AdminError> {
        self.engine
            .store(name)
            .ok_or_else(|| AdminError::UnknownStore(name.to_string()))
    }

    /// Snapshots for every registered store, ordered by name.
    pub fn stats(&self) -> Vec<StatsSnapshot> {
        self.engine.stats()
    }

    pub fn store_stats(&self, name: &str) -> Result<StatsSnapshot, AdminError> {
        Ok(self.store(name)?.stats())
    }

    /// Empty one store, or all of them when `store` is `None`.
    pub async fn clear_cache(&self, store: Option<&str>) -> Result<(), AdminError> {
        match store {
            Some(name) => {
                self.store(name)?.invalidate_all().await;
                info!(store = name, "cache store cleared by operator");
            }
            None => {
                self.engine.invalidate_all().await;
                info!("all cache stores cleared by operator");
            }
        }
        Ok(())
    }

    pub async fn keys(&self, store: &str) -> Result<Vec<EntrySummary>, AdminError> {
        let mut keys: Vec<EntrySummary> = self
            .store(store)?
            .keys()
            .await
            .iter()
            .map(EntrySummary::from)
            .collect();
        keys.sort_by(|left, right| left.key.cmp(&right.key));
        Ok(keys)
    }

    /// Look an entry up by key hash without counting it as an access.
    pub async fn entry(&self, store: &str, hash: &str) -> Result<Option<EntryView>, AdminError> {
        let store = self.store(store)?;
        let Some(key) = store.keys().await.into_iter().find(|key| key.hash_hex() == hash) else {
            return Ok(None);
        };
        let Some(content) = store.peek(&key).await else {
            return Ok(None);
        };
        Ok(Some(EntryView {
            summary: EntrySummary::from(&key),
            status: content.status().as_u16(),
            content_type: content.content_type().map(str::to_string),
            character_encoding: content.character_encoding().map(str::to_string),
            headers: content
                .headers()
                .iter()
                .map(|(name, values)| {
                    (name.clone(), values.iter().map(StoredHeaderValue::to_display).collect())
                })
                .collect(),
            body_len: content.payload().len(),
        }))
    }

    /// Drop a single entry by key hash. Returns whether it existed.
    pub async fn invalidate_entry(&self, store: &str, hash: &str) -> Result<bool, AdminError> {
        let store = self.store(store)?;
        let Some(key) = store.keys().await.into_iter().find(|key| key.hash_hex() == hash) else {
            return Ok(false);
        };
        store.invalidate(&key).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, StatusCode};
    use bytes::Bytes;

    use super::*;
    use crate::cache::content::CacheContent;
    use crate::cache::memory::{MemoryStore, MemoryStoreSettings};

    async fn admin_with_entries() -> (CacheAdmin, Arc<MemoryStore>, CacheKey) {
        let engine = Arc::new(CacheEngine::new());
        let store = Arc::new(MemoryStore::new(MemoryStoreSettings::new("memory", 8)));
        engine.register_store(store.clone());

        let mut first = None;
        for path in ["/b", "/a"] {
            let key = CacheKey::builder("pages", path).build().expect("key");
            let content = CacheContent::from_response(StatusCode::OK, &HeaderMap::new(), &[], Bytes::from("body"));
            store.put(key.clone(), content).await.expect("put");
            first.get_or_insert(key);
        }
        (CacheAdmin::new(engine), store, first.expect("key"))
    }

    #[tokio::test]
    async fn keys_are_listed_in_key_order() {
        let (admin, _, _) = admin_with_entries().await;
        let keys = admin.keys("memory").await.expect("keys");
        assert_eq!(keys.len(), 2);
        assert!(keys[0].key < keys[1].key);
        assert!(keys.iter().all(|entry| entry.config == "pages"));
    }

    #[tokio::test]
    async fn entry_lookup_does_not_count_as_a_hit() {
        let (admin, store, key) = admin_with_entries().await;
        let view = admin
            .entry("memory", key.hash_hex())
            .await
            .expect("store")
            .expect("entry");
        assert_eq!(view.status, 200);
        assert_eq!(view.body_len, 4);
        assert_eq!(store.stats().hits, 0);

        assert!(admin.entry("memory", "0000").await.expect("store").is_none());
    }

    #[tokio::test]
    async fn unknown_stores_are_reported() {
        let (admin, _, _) = admin_with_entries().await;
        assert_eq!(
            admin.clear_cache(Some("disk")).await,
            Err(AdminError::UnknownStore("disk".to_string()))
        );
        assert!(admin.keys("disk").await.is_err());
    }

    #[tokio::test]
    async fn clear_and_single_invalidation() {
        let (admin, store, key) = admin_with_entries().await;
        assert!(admin.invalidate_entry("memory", key.hash_hex()).await.expect("store"));
        assert!(!admin.invalidate_entry("memory", key.hash_hex()).await.expect("store"));
        assert_eq!(store.size().await, 1);

        admin.clear_cache(None).await.expect("clear");
        assert_eq!(store.size().await, 0);
        assert_eq!(admin.stats()[0].entries, 0);
    }
}
