//! Bounded in-memory store.
//!
//! An LRU map guarded by a single lock, bounded by entry count and optionally
//! by an approximate byte budget. Deadlines are kept per entry and checked
//! lazily on every read; `purge_expired` sweeps the rest.

use std::num::NonZeroUsize;
use std::sync::RwLock;

use async_trait::async_trait;
use lru::LruCache;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::content::{CacheContent, Payload};
use super::expiry::{Expiry, ExpiryPolicy};
use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};
use super::sink::{CaptureSink, MemorySink};
use super::stats::{StatsSnapshot, StoreStats};
use super::store::{CacheStore, InvalidationRule, StoreError};

const SOURCE: &str = "cache::memory";

/// Construction parameters for [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryStoreSettings {
    pub name: String,
    pub max_entries: NonZeroUsize,
    pub max_bytes: Option<u64>,
    pub expiry: ExpiryPolicy,
    /// Largest body a capture may buffer for this store.
    pub capture_limit_bytes: Option<u64>,
}

impl MemoryStoreSettings {
    pub fn new(name: impl Into<String>, max_entries: usize) -> Self {
        Self {
            name: name.into(),
            max_entries: NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN),
            max_bytes: None,
            expiry: ExpiryPolicy::default(),
            capture_limit_bytes: None,
        }
    }
}

struct MemoryEntry {
    content: CacheContent,
    expires_at: Option<Instant>,
    size: u64,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

struct MemoryState {
    lru: LruCache<CacheKey, MemoryEntry>,
    bytes: u64,
}

impl MemoryState {
    fn remove(&mut self, key: &CacheKey) -> Option<MemoryEntry> {
        let entry = self.lru.pop(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size);
        Some(entry)
    }
}

pub struct MemoryStore {
    settings: MemoryStoreSettings,
    state: RwLock<MemoryState>,
    stats: StoreStats,
}

impl MemoryStore {
    pub fn new(settings: MemoryStoreSettings) -> Self {
        let stats = StoreStats::new(settings.name.clone());
        Self {
            state: RwLock::new(MemoryState {
                lru: LruCache::new(settings.max_entries),
                bytes: 0,
            }),
            settings,
            stats,
        }
    }

    fn publish_occupancy(&self, state: &MemoryState) {
        self.stats.set_occupancy(state.lru.len() as u64, state.bytes);
    }

    /// A deadline past what the clock can represent never arrives.
    fn resolve_deadline(expiry: Expiry, now: Instant, current: Option<Instant>) -> Option<Instant> {
        match expiry {
            Expiry::After(ttl) => now.checked_add(ttl),
            Expiry::Never => None,
            Expiry::Unchanged => current,
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn put(&self, key: CacheKey, content: CacheContent) -> Result<(), StoreError> {
        let size = content.approximate_size();
        if let Some(max_bytes) = self.settings.max_bytes
            && size > max_bytes
        {
            debug!(
                store = %self.settings.name,
                key = %key,
                size,
                max_bytes,
                "entry exceeds store byte budget, not cached"
            );
            return Ok(());
        }

        let now = Instant::now();
        let mut state = rw_write(&self.state, SOURCE, "put");

        let previous = state.remove(&key).filter(|entry| !entry.is_expired(now));
        let expiry = match previous {
            Some(_) => self.settings.expiry.for_update(&key),
            None => self.settings.expiry.for_creation(&key),
        };
        let expires_at =
            Self::resolve_deadline(expiry, now, previous.and_then(|entry| entry.expires_at));

        state.bytes += size;
        let entry = MemoryEntry {
            content,
            expires_at,
            size,
        };
        if let Some((_, evicted)) = state.lru.push(key, entry) {
            state.bytes = state.bytes.saturating_sub(evicted.size);
            self.stats.record_eviction();
        }

        if let Some(max_bytes) = self.settings.max_bytes {
            while state.bytes > max_bytes {
                let Some((_, evicted)) = state.lru.pop_lru() else {
                    break;
                };
                state.bytes = state.bytes.saturating_sub(evicted.size);
                self.stats.record_eviction();
            }
        }

        self.stats.record_put();
        self.publish_occupancy(&state);
        Ok(())
    }

    async fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        rw_read(&self.state, SOURCE, "contains")
            .lru
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    async fn get(&self, key: &CacheKey) -> Option<CacheContent> {
        let now = Instant::now();
        let found = {
            let mut state = rw_write(&self.state, SOURCE, "get");
            match state.lru.get_mut(key) {
                Some(entry) if !entry.is_expired(now) => {
                    let access = self.settings.expiry.for_access(key);
                    entry.expires_at = Self::resolve_deadline(access, now, entry.expires_at);
                    Some(entry.content.clone())
                }
                Some(_) => {
                    state.remove(key);
                    self.publish_occupancy(&state);
                    None
                }
                None => None,
            }
        };

        let Some(content) = found else {
            self.stats.record_miss();
            return None;
        };

        let content = match content.payload() {
            Payload::Inline(_) => content,
            Payload::Spooled(spooled) => match content.payload().load().await {
                Ok(bytes) => content.with_inline_payload(bytes),
                Err(error) => {
                    warn!(
                        store = %self.settings.name,
                        key = %key,
                        path = %spooled.path().display(),
                        error = %error,
                        "stored payload unreadable, dropping entry"
                    );
                    self.invalidate(key).await;
                    self.stats.record_miss();
                    return None;
                }
            },
        };

        self.stats.record_hit();
        Some(content)
    }

    async fn peek(&self, key: &CacheKey) -> Option<CacheContent> {
        let now = Instant::now();
        let content = rw_read(&self.state, SOURCE, "peek")
            .lru
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.content.clone())?;
        match content.payload().load().await {
            Ok(bytes) => Some(content.with_inline_payload(bytes)),
            Err(_) => None,
        }
    }

    async fn invalidate(&self, key: &CacheKey) {
        let mut state = rw_write(&self.state, SOURCE, "invalidate");
        if state.remove(key).is_some() {
            self.stats.record_invalidations(1);
            self.publish_occupancy(&state);
        }
    }

    async fn invalidate_matching(&self, rule: &dyn InvalidationRule) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "invalidate_matching");
        let matching: Vec<CacheKey> = state
            .lru
            .iter()
            .filter(|(key, _)| rule.knows_key(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &matching {
            state.remove(key);
        }
        self.stats.record_invalidations(matching.len() as u64);
        self.publish_occupancy(&state);
        matching.len()
    }

    async fn invalidate_all(&self) {
        let mut state = rw_write(&self.state, SOURCE, "invalidate_all");
        state.lru.clear();
        state.bytes = 0;
        self.stats.reset();
    }

    async fn size(&self) -> usize {
        let now = Instant::now();
        rw_read(&self.state, SOURCE, "size")
            .lru
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .count()
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = rw_write(&self.state, SOURCE, "purge_expired");
        let expired: Vec<CacheKey> = state
            .lru
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        self.publish_occupancy(&state);
        expired.len()
    }

    async fn keys(&self) -> Vec<CacheKey> {
        let now = Instant::now();
        rw_read(&self.state, SOURCE, "keys")
            .lru
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn create_sink(&self) -> Result<Box<dyn CaptureSink>, StoreError> {
        Ok(Box::new(MemorySink::new(self.settings.capture_limit_bytes)))
    }
}
