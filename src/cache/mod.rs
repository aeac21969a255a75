//! Strata response cache.
//!
//! Ranked [`CacheConfig`]s decide which requests are cacheable and how they
//! are keyed. Captured responses land in a named [`CacheStore`]:
//!
//! - [`MemoryStore`]: bounded LRU with time-based expiry
//! - [`PersistentStore`]: durable entries sharded over a [`TreeSubstrate`]
//!   in a bounded fan-out bucket tree
//!
//! The [`CacheEngine`] ties configs and stores together and is driven either
//! by the axum [`response_cache_layer`] or directly through the synchronous
//! [`HostResponse`] model.

mod admin;
mod bucket;
mod capture;
mod config;
mod content;
mod engine;
mod expiry;
mod host;
mod keys;
mod lock;
mod memory;
mod middleware;
mod persistent;
mod request;
mod sink;
mod stats;
mod store;
pub mod substrate;

pub use admin::{AdminError, CacheAdmin, EntrySummary, EntryView};
pub use bucket::{BucketCursor, BucketLayout, LayoutError};
pub use capture::{
    AbandonReason, ByteOutput, CaptureError, CaptureResponse, CapturedResponse, OutputMode,
    ResponseSink, TextEncoding, TextOutput,
};
pub use config::{CacheConfig, PathPattern, RuleConfig, ScopeFilter};
pub use content::{CacheContent, ContentMeta, Payload, SpooledPayload, StoredHeaderValue};
pub use engine::{CacheEngine, CachePhase, NotCacheable, check_cacheable};
pub use expiry::{Expiry, ExpiryPolicy, TtlLiteral, parse_ttl};
pub use host::{BufferedResponse, HostResponse};
pub use keys::{CacheKey, KeyBuilder, KeyError, KeyExpiry};
pub use memory::{MemoryStore, MemoryStoreSettings};
pub use middleware::{CacheState, CaptureBody, response_cache_layer};
pub use persistent::{
    BUCKETS_CONTAINER, KEY_HASH_PROPERTY, LAYOUT_NODE, PersistentStore, PersistentStoreSettings,
};
pub use request::{CacheRequest, RequestScope};
pub use sink::{CaptureSink, MemorySink, SpoolSink};
pub use stats::{StatsSnapshot, StoreStats};
pub use store::{CacheStore, InvalidationRule, StoreError};
pub use substrate::{FsSubstrate, MemorySubstrate, TreeSubstrate};
