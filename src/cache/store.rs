//! Pluggable cache store contract.

use async_trait::async_trait;
use thiserror::Error;

use super::bucket::LayoutError;
use super::content::CacheContent;
use super::keys::CacheKey;
use super::sink::CaptureSink;
use super::stats::StatsSnapshot;
use super::substrate::SubstrateError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
    #[error("failed to encode or decode entry: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store `{store}` has no free slot ({capacity} slots)")]
    Full { store: String, capacity: u64 },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Predicate used to bulk-remove entries, typically "every key this config built".
pub trait InvalidationRule: Send + Sync {
    fn knows_key(&self, key: &CacheKey) -> bool;
}

impl<F> InvalidationRule for F
where
    F: Fn(&CacheKey) -> bool + Send + Sync,
{
    fn knows_key(&self, key: &CacheKey) -> bool {
        self(key)
    }
}

/// A cache backend.
///
/// Reads never fail: anything that goes wrong while reading is reported as a
/// miss so the request can be recomputed downstream. Only `put` surfaces
/// errors, and callers are expected to log and drop them.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Registry name, referenced by cache configs.
    fn name(&self) -> &str;

    /// Insert or replace the entry for `key`.
    async fn put(&self, key: CacheKey, content: CacheContent) -> Result<(), StoreError>;

    /// Existence check that does not count as an access.
    async fn contains(&self, key: &CacheKey) -> bool;

    async fn get(&self, key: &CacheKey) -> Option<CacheContent>;

    /// Read an entry without touching statistics, recency or access expiry.
    async fn peek(&self, key: &CacheKey) -> Option<CacheContent>;

    /// Remove one entry; absent keys are a no-op.
    async fn invalidate(&self, key: &CacheKey);

    /// Remove every entry whose key the rule knows. Returns how many went.
    async fn invalidate_matching(&self, rule: &dyn InvalidationRule) -> usize;

    async fn invalidate_all(&self);

    async fn size(&self) -> usize;

    /// Sweep entries whose deadline has passed. Returns how many went.
    async fn purge_expired(&self) -> usize {
        0
    }

    /// Keys of every live entry, in no particular order.
    async fn keys(&self) -> Vec<CacheKey>;

    fn stats(&self) -> StatsSnapshot;

    /// Temporary sink a capture writes into before `put`.
    fn create_sink(&self) -> Result<Box<dyn CaptureSink>, StoreError>;
}
