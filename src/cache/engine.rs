//! Request-level cache orchestration.
//!
//! The engine owns no entries itself. It resolves the highest ranked config
//! that accepts a request, finds that config's store by name and drives the
//! lookup, capture and persist steps:
//!
//! ```text
//! NotMatched
//! Matched ─┬─ Hit ── Delivered
//!          └─ Miss ── Capturing ─┬─ Cached
//!                                └─ CaptureAbandoned
//! ```
//!
//! Cache failures never fail the request; they degrade to a miss or to an
//! uncached response.

use std::cmp::Reverse;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::capture::{Capture, CaptureResponse, CapturedResponse};
use super::config::CacheConfig;
use super::content::CacheContent;
use super::host::HostResponse;
use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};
use super::request::{CacheRequest, RequestScope};
use super::stats::StatsSnapshot;
use super::store::CacheStore;

const SOURCE: &str = "cache::engine";

/// Where a request ended up in the cache flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    NotMatched,
    Matched,
    Hit,
    Delivered,
    Miss,
    Capturing,
    Cached,
    CaptureAbandoned,
}

impl CachePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            CachePhase::NotMatched => "not_matched",
            CachePhase::Matched => "matched",
            CachePhase::Hit => "hit",
            CachePhase::Delivered => "delivered",
            CachePhase::Miss => "miss",
            CachePhase::Capturing => "capturing",
            CachePhase::Cached => "cached",
            CachePhase::CaptureAbandoned => "capture_abandoned",
        }
    }

    /// Whether the flow may move from `self` to `next`.
    pub fn can_advance_to(self, next: CachePhase) -> bool {
        use CachePhase::*;
        matches!(
            (self, next),
            (Matched, Hit)
                | (Matched, Miss)
                | (Hit, Delivered)
                | (Hit, Miss)
                | (Miss, Capturing)
                | (Capturing, Cached)
                | (Capturing, CaptureAbandoned)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CachePhase::NotMatched
                | CachePhase::Delivered
                | CachePhase::Cached
                | CachePhase::CaptureAbandoned
        )
    }
}

impl fmt::Display for CachePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a completed response was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotCacheable {
    Status(StatusCode),
    TooLarge { len: u64, limit: u64 },
    SetCookie,
    EventStream,
    RejectedByConfig,
}

impl fmt::Display for NotCacheable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotCacheable::Status(status) => write!(f, "status {status} is not cacheable"),
            NotCacheable::TooLarge { len, limit } => {
                write!(f, "body of {len} bytes exceeds limit of {limit}")
            }
            NotCacheable::SetCookie => f.write_str("response sets a cookie"),
            NotCacheable::EventStream => f.write_str("response is an event stream"),
            NotCacheable::RejectedByConfig => f.write_str("rejected by config"),
        }
    }
}

/// Response-side cacheability checks shared by every host model.
pub fn check_cacheable(
    config: &dyn CacheConfig,
    status: StatusCode,
    headers: &HeaderMap,
    body_len: Option<u64>,
) -> Result<(), NotCacheable> {
    if !config.cacheable_statuses().contains(&status) {
        return Err(NotCacheable::Status(status));
    }
    if let (Some(len), Some(limit)) = (body_len, config.max_body_bytes())
        && len > limit
    {
        return Err(NotCacheable::TooLarge { len, limit });
    }
    if headers.contains_key(header::SET_COOKIE) {
        return Err(NotCacheable::SetCookie);
    }
    if headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return Err(NotCacheable::EventStream);
    }
    if !config.accepts_response(status, headers) {
        return Err(NotCacheable::RejectedByConfig);
    }
    Ok(())
}

struct Registered {
    config: Arc<dyn CacheConfig>,
    order: u64,
}

#[derive(Default)]
pub struct CacheEngine {
    configs: RwLock<Vec<Registered>>,
    stores: DashMap<String, Arc<dyn CacheStore>>,
    sequence: AtomicU64,
}

impl CacheEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a config. Equal ranks keep registration order.
    pub fn register_config(&self, config: Arc<dyn CacheConfig>) {
        let order = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut configs = rw_write(&self.configs, SOURCE, "register_config");
        configs.retain(|registered| registered.config.id() != config.id());
        debug!(config = config.id(), rank = config.rank(), store = config.store_name(), "cache config registered");
        configs.push(Registered { config, order });
        configs.sort_by_key(|registered| (Reverse(registered.config.rank()), registered.order));
    }

    /// Retire a config and drop every entry it built. Returns the number of
    /// entries invalidated, or `None` if no config had that id.
    pub async fn unregister_config(&self, id: &str) -> Option<usize> {
        let removed = {
            let mut configs = rw_write(&self.configs, SOURCE, "unregister_config");
            let index = configs.iter().position(|registered| registered.config.id() == id)?;
            configs.remove(index).config
        };
        let invalidated = self.invalidate_entries_of(removed.as_ref()).await;
        info!(config = id, invalidated, "cache config unregistered");
        Some(invalidated)
    }

    /// Register a store under its own name, returning any store it replaced.
    pub fn register_store(&self, store: Arc<dyn CacheStore>) -> Option<Arc<dyn CacheStore>> {
        let name = store.name().to_string();
        debug!(store = %name, "cache store registered");
        self.stores.insert(name, store)
    }

    pub fn unregister_store(&self, name: &str) -> Option<Arc<dyn CacheStore>> {
        self.stores.remove(name).map(|(_, store)| store)
    }

    pub fn store(&self, name: &str) -> Option<Arc<dyn CacheStore>> {
        self.stores.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn stores(&self) -> Vec<Arc<dyn CacheStore>> {
        let mut stores: Vec<_> = self.stores.iter().map(|entry| Arc::clone(entry.value())).collect();
        stores.sort_by(|left, right| left.name().cmp(right.name()));
        stores
    }

    /// Configs in consultation order.
    pub fn configs(&self) -> Vec<Arc<dyn CacheConfig>> {
        rw_read(&self.configs, SOURCE, "configs")
            .iter()
            .map(|registered| Arc::clone(&registered.config))
            .collect()
    }

    pub fn config(&self, id: &str) -> Option<Arc<dyn CacheConfig>> {
        rw_read(&self.configs, SOURCE, "config")
            .iter()
            .find(|registered| registered.config.id() == id)
            .map(|registered| Arc::clone(&registered.config))
    }

    /// Highest ranked config accepting `request` in `scope`.
    pub fn get_cache_config(
        &self,
        request: &CacheRequest,
        scope: RequestScope,
    ) -> Option<Arc<dyn CacheConfig>> {
        rw_read(&self.configs, SOURCE, "get_cache_config")
            .iter()
            .find(|registered| registered.config.accepts(request, scope))
            .map(|registered| Arc::clone(&registered.config))
    }

    pub fn store_for(&self, config: &dyn CacheConfig) -> Option<Arc<dyn CacheStore>> {
        let store = self.store(config.store_name());
        if store.is_none() {
            debug!(config = config.id(), store = config.store_name(), "config references an unregistered store");
        }
        store
    }

    /// Build the key for `request`, logging failures. `None` means not cacheable.
    pub fn key_for(&self, request: &CacheRequest, config: &dyn CacheConfig) -> Option<CacheKey> {
        match config.build_key(request) {
            Ok(key) => Some(key),
            Err(error) => {
                debug!(config = config.id(), path = request.path(), error = %error, "request not cacheable");
                None
            }
        }
    }

    pub async fn is_cache_hit(&self, request: &CacheRequest, config: &dyn CacheConfig) -> bool {
        let Some(store) = self.store_for(config) else {
            return false;
        };
        let Some(key) = self.key_for(request, config) else {
            return false;
        };
        store.contains(&key).await
    }

    /// Fetch the stored representation for `request`.
    pub async fn lookup(&self, request: &CacheRequest, config: &dyn CacheConfig) -> Option<CacheContent> {
        let store = self.store_for(config)?;
        let key = self.key_for(request, config)?;
        store.get(&key).await
    }

    /// Write a cached representation to `response`. Returns `false` when the
    /// entry vanished since the hit check, so the caller should render.
    pub async fn deliver_cache_content<R: HostResponse + ?Sized>(
        &self,
        request: &CacheRequest,
        response: &mut R,
        config: &dyn CacheConfig,
    ) -> bool {
        let Some(content) = self.lookup(request, config).await else {
            debug!(config = config.id(), path = request.path(), "cached entry vanished before delivery");
            return false;
        };
        let body = match content.payload().load().await {
            Ok(body) => body,
            Err(error) => {
                warn!(config = config.id(), error = %error, "cached payload unreadable");
                return false;
            }
        };

        response.set_status(content.status());
        let headers = response.headers_mut();
        for (name, value) in content.header_map().iter() {
            headers.append(name.clone(), value.clone());
        }
        if let Some(content_type) = content.content_type()
            && let Ok(value) = HeaderValue::from_str(content_type)
        {
            headers.insert(header::CONTENT_TYPE, value);
        }

        let output = response.output();
        if let Err(error) = output.write_all(&body).and_then(|()| output.flush()) {
            warn!(config = config.id(), path = request.path(), error = %error, "client write failed while delivering cached content");
        }
        debug!(cache = config.store_name(), outcome = "hit", path = request.path(), "served from cache");
        true
    }

    /// Wrap `response` so its output is captured into a sink from the
    /// config's store. `None` when the store is missing or cannot provide a sink.
    pub fn wrap_response<'a, R: HostResponse + ?Sized>(
        &self,
        request: &CacheRequest,
        response: &'a mut R,
        config: &dyn CacheConfig,
    ) -> Option<CaptureResponse<'a, R>> {
        let capture = self.begin_capture(request, config)?;
        Some(CaptureResponse::new(response, capture))
    }

    pub(crate) fn begin_capture(&self, request: &CacheRequest, config: &dyn CacheConfig) -> Option<Capture> {
        let store = self.store_for(config)?;
        match store.create_sink() {
            Ok(sink) => Some(Capture::new(store.name(), sink)),
            Err(error) => {
                warn!(store = store.name(), path = request.path(), error = %error, "capture sink unavailable");
                None
            }
        }
    }

    /// Persist a finished capture if it is cacheable. Returns whether it was stored.
    pub async fn cache_response(
        &self,
        request: &CacheRequest,
        captured: CapturedResponse,
        config: &dyn CacheConfig,
    ) -> bool {
        if let Err(reason) =
            check_cacheable(config, captured.status, &captured.headers, Some(captured.body_len()))
        {
            debug!(config = config.id(), path = request.path(), reason = %reason, "response not cached");
            return false;
        }
        let Some(store) = self.store_for(config) else {
            return false;
        };
        let Some(key) = self.key_for(request, config) else {
            return false;
        };

        let content = captured.into_content(config.excluded_headers());
        match store.put(key, content).await {
            Ok(()) => {
                debug!(cache = store.name(), outcome = "stored", path = request.path(), "response cached");
                true
            }
            Err(error) => {
                warn!(store = store.name(), path = request.path(), error = %error, "failed to store response");
                false
            }
        }
    }

    /// Drop the entries every config accepting `request` would serve for it.
    pub async fn invalidate_request(&self, request: &CacheRequest) -> usize {
        let mut removed = 0;
        for config in self.configs() {
            if !config.accepts(request, request.scope()) {
                continue;
            }
            let (Some(store), Some(key)) = (self.store_for(config.as_ref()), self.key_for(request, config.as_ref())) else {
                continue;
            };
            if store.contains(&key).await {
                store.invalidate(&key).await;
                removed += 1;
            }
        }
        removed
    }

    /// Drop every entry built by the config with `id`.
    pub async fn invalidate_config(&self, id: &str) -> Option<usize> {
        let config = self.config(id)?;
        Some(self.invalidate_entries_of(config.as_ref()).await)
    }

    async fn invalidate_entries_of(&self, config: &dyn CacheConfig) -> usize {
        let Some(store) = self.store_for(config) else {
            return 0;
        };
        let rule = |key: &CacheKey| config.knows_key(key);
        store.invalidate_matching(&rule).await
    }

    pub async fn invalidate_all(&self) {
        for store in self.stores() {
            store.invalidate_all().await;
            info!(store = store.name(), "cache store cleared");
        }
    }

    pub async fn purge_expired(&self) -> usize {
        let mut purged = 0;
        for store in self.stores() {
            purged += store.purge_expired().await;
        }
        purged
    }

    pub fn stats(&self) -> Vec<StatsSnapshot> {
        self.stores().iter().map(|store| store.stats()).collect()
    }
}
