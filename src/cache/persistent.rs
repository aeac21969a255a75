//! Durable store laid out as a bounded fan-out bucket tree.
//!
//! Every entry is a single substrate node below the store's bucket container:
//!
//! ```text
//! <root>/_layout                    layout = {"bucket_size":..,"depth":..}
//! <root>/buckets/<d1>/../<dN>/e<i>  key, key_hash, meta, body
//! ```
//!
//! The store root only holds the layout record and the bucket container, so
//! every container from `buckets` down has at most `bucket_size` children.
//!
//! Entries are located through the substrate's `key_hash` index. Substrates
//! without one are scanned instead; the scan is bounded by the layout
//! capacity.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::bucket::{BucketCursor, BucketLayout};
use super::content::{CacheContent, ContentMeta};
use super::expiry::{Expiry, ExpiryPolicy};
use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::sink::{CaptureSink, SpoolSink};
use super::stats::{StatsSnapshot, StoreStats};
use super::store::{CacheStore, InvalidationRule, StoreError};
use super::substrate::{ChildKind, Node, NodePath, SubstrateError, TreeSubstrate};

const SOURCE: &str = "cache::persistent";
pub const LAYOUT_NODE: &str = "_layout";
const LAYOUT_PROPERTY: &str = "layout";
pub const BUCKETS_CONTAINER: &str = "buckets";
const KEY_PROPERTY: &str = "key";
pub const KEY_HASH_PROPERTY: &str = "key_hash";
const META_PROPERTY: &str = "meta";
const BODY_PROPERTY: &str = "body";
const WRITE_STRIPES: usize = 64;

#[derive(Debug, Clone)]
pub struct PersistentStoreSettings {
    pub name: String,
    pub root: NodePath,
    pub bucket_size: u32,
    pub expected_entries: u64,
    pub expiry: ExpiryPolicy,
    /// Captures larger than this spill to a temp file.
    pub spool_threshold: usize,
    pub capture_limit_bytes: Option<u64>,
    pub spool_dir: Option<PathBuf>,
}

impl PersistentStoreSettings {
    pub fn new(name: impl Into<String>, bucket_size: u32, expected_entries: u64) -> Self {
        Self {
            name: name.into(),
            root: NodePath::root(),
            bucket_size,
            expected_entries,
            expiry: ExpiryPolicy::default(),
            spool_threshold: 64 * 1024,
            capture_limit_bytes: None,
            spool_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMeta {
    #[serde(flatten)]
    content: ContentMeta,
    body_len: u64,
    #[serde(with = "time::serde::rfc3339")]
    stored_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expires_at: Option<OffsetDateTime>,
}

impl StoredMeta {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Decoded entry node.
struct StoredEntry {
    path: NodePath,
    key: CacheKey,
    meta: StoredMeta,
    body: Bytes,
}

impl StoredEntry {
    fn decode(node: Node) -> Result<Self, StoreError> {
        let missing = |name: &str| StoreError::Substrate(SubstrateError::Corrupt {
            path: node.path.clone(),
            reason: format!("missing `{name}` property"),
        });
        let key = serde_json::from_slice(node.property(KEY_PROPERTY).ok_or_else(|| missing(KEY_PROPERTY))?)?;
        let meta = serde_json::from_slice(node.property(META_PROPERTY).ok_or_else(|| missing(META_PROPERTY))?)?;
        let body = node
            .property(BODY_PROPERTY)
            .cloned()
            .ok_or_else(|| missing(BODY_PROPERTY))?;
        Ok(Self {
            path: node.path,
            key,
            meta,
            body,
        })
    }

    fn encode(key: &CacheKey, meta: &StoredMeta, body: Bytes) -> Result<Vec<(String, Bytes)>, StoreError> {
        Ok(vec![
            (KEY_PROPERTY.to_string(), Bytes::from(serde_json::to_vec(key)?)),
            (
                KEY_HASH_PROPERTY.to_string(),
                Bytes::copy_from_slice(key.hash_hex().as_bytes()),
            ),
            (META_PROPERTY.to_string(), Bytes::from(serde_json::to_vec(meta)?)),
            (BODY_PROPERTY.to_string(), body),
        ])
    }

    fn into_content(self) -> CacheContent {
        CacheContent::new(self.meta.content, self.body)
    }
}

/// Fresh-slot cursor plus slots freed by invalidation.
#[derive(Debug)]
struct SlotAllocator {
    cursor: BucketCursor,
    free: BTreeSet<u64>,
}

impl SlotAllocator {
    fn recover(layout: &BucketLayout, occupied: &[u64]) -> Self {
        let next = occupied.iter().max().map_or(0, |slot| slot + 1);
        let taken: BTreeSet<u64> = occupied.iter().copied().collect();
        Self {
            cursor: layout.cursor_at(next),
            free: (0..next).filter(|slot| !taken.contains(slot)).collect(),
        }
    }

    fn reserve(&mut self) -> Option<u64> {
        if let Some(slot) = self.free.pop_first() {
            return Some(slot);
        }
        if self.cursor.is_exhausted() {
            return None;
        }
        let slot = self.cursor.slot();
        self.cursor.advance();
        Some(slot)
    }

    fn release(&mut self, slot: u64) {
        self.free.insert(slot);
    }
}

pub struct PersistentStore {
    settings: PersistentStoreSettings,
    substrate: Arc<dyn TreeSubstrate>,
    layout: BucketLayout,
    buckets: NodePath,
    allocator: Mutex<SlotAllocator>,
    stripes: Vec<tokio::sync::Mutex<()>>,
    stats: StoreStats,
    scan_reported: AtomicBool,
}

impl PersistentStore {
    /// Open the store, recovering layout, cursor and free slots from the tree.
    ///
    /// A layout already persisted under the root wins over the configured one.
    pub async fn open(
        settings: PersistentStoreSettings,
        substrate: Arc<dyn TreeSubstrate>,
    ) -> Result<Self, StoreError> {
        let configured = BucketLayout::for_entries(settings.bucket_size, settings.expected_entries)?;
        let layout_node = settings.root.child(LAYOUT_NODE);

        let layout = match substrate.read_property(&layout_node, LAYOUT_PROPERTY).await? {
            Some(raw) => {
                let stored: BucketLayout = serde_json::from_slice(&raw)?;
                let stored = BucketLayout::with_depth(stored.bucket_size(), stored.depth())?;
                if stored != configured {
                    info!(
                        store = %settings.name,
                        persisted = %stored,
                        configured = %configured,
                        "using persisted bucket layout"
                    );
                }
                stored
            }
            None => {
                write_layout(substrate.as_ref(), &settings.root, &configured).await?;
                configured
            }
        };

        let mut store = Self {
            stats: StoreStats::new(settings.name.clone()),
            allocator: Mutex::new(SlotAllocator::recover(&layout, &[])),
            stripes: (0..WRITE_STRIPES).map(|_| tokio::sync::Mutex::new(())).collect(),
            scan_reported: AtomicBool::new(false),
            buckets: settings.root.child(BUCKETS_CONTAINER),
            settings,
            substrate,
            layout,
        };

        let occupied: Vec<u64> = store.walk().await?.into_iter().map(|(slot, _)| slot).collect();
        store.allocator = Mutex::new(SlotAllocator::recover(&layout, &occupied));
        store.stats.set_occupancy(occupied.len() as u64, 0);

        debug!(
            store = %store.settings.name,
            layout = %layout,
            entries = occupied.len(),
            "persistent store opened"
        );
        Ok(store)
    }

    pub fn layout(&self) -> BucketLayout {
        self.layout
    }

    fn stripe(&self, hash: &str) -> &tokio::sync::Mutex<()> {
        let index = hash
            .get(..2)
            .and_then(|prefix| usize::from_str_radix(prefix, 16).ok())
            .unwrap_or(0);
        &self.stripes[index % self.stripes.len()]
    }

    fn slot_of(&self, path: &NodePath) -> Option<u64> {
        self.layout.slot_of(path.strip_prefix(&self.buckets)?)
    }

    /// Every entry node in the bucket tree with its slot, in slot order.
    async fn walk(&self) -> Result<Vec<(u64, NodePath)>, StoreError> {
        let depth = self.layout.depth() as usize;
        let base = self.buckets.segments().len();
        let mut entries = Vec::new();
        let mut pending = vec![self.buckets.clone()];

        while let Some(container) = pending.pop() {
            let level = container.segments().len() - base;
            for child in self.substrate.list_children(&container).await? {
                if child.name.starts_with('_') {
                    continue;
                }
                let path = container.child(child.name);
                match child.kind {
                    ChildKind::Container if level < depth => pending.push(path),
                    ChildKind::Node if level == depth => match self.slot_of(&path) {
                        Some(slot) => entries.push((slot, path)),
                        None => debug!(node = %path, "skipping foreign node"),
                    },
                    _ => debug!(node = %path, "skipping node outside the layout"),
                }
            }
        }

        entries.sort_by_key(|(slot, _)| *slot);
        Ok(entries)
    }

    /// Find the node holding `key`.
    async fn locate(&self, key: &CacheKey) -> Result<Option<Node>, StoreError> {
        let hash = key.hash_hex().as_bytes();
        match self.substrate.query_indexed(KEY_HASH_PROPERTY, hash).await {
            Ok(paths) => {
                for path in paths {
                    if path.strip_prefix(&self.buckets).is_none() {
                        continue;
                    }
                    if let Some(node) = self.substrate.read_node(&path).await?
                        && node.property(KEY_HASH_PROPERTY).is_some_and(|stored| stored.as_ref() == hash)
                    {
                        return Ok(Some(node));
                    }
                }
                Ok(None)
            }
            Err(SubstrateError::Unsupported) => {
                if !self.scan_reported.swap(true, Ordering::Relaxed) {
                    debug!(
                        store = %self.settings.name,
                        "substrate has no index, falling back to tree scans"
                    );
                }
                self.scan_for(hash).await
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn scan_for(&self, hash: &[u8]) -> Result<Option<Node>, StoreError> {
        for (_, path) in self.walk().await? {
            let stored = self.substrate.read_property(&path, KEY_HASH_PROPERTY).await?;
            if stored.is_some_and(|stored| stored.as_ref() == hash) {
                return Ok(self.substrate.read_node(&path).await?);
            }
        }
        Ok(None)
    }

    /// Locate and decode. Nothing is removed here; callers decide.
    async fn load(&self, key: &CacheKey) -> Loaded {
        let node = match self.locate(key).await {
            Ok(Some(node)) => node,
            Ok(None) => return Loaded::Absent,
            Err(error) => {
                warn!(store = %self.settings.name, key = %key, error = %error, "entry lookup failed");
                return Loaded::Absent;
            }
        };
        let path = node.path.clone();
        match StoredEntry::decode(node) {
            Ok(entry) if entry.key == *key => Loaded::Entry(entry),
            Ok(_) => {
                warn!(store = %self.settings.name, node = %path, "key hash collision, ignoring entry");
                Loaded::Absent
            }
            Err(error) => {
                warn!(
                    store = %self.settings.name,
                    node = %path,
                    error = %error,
                    "undecodable entry"
                );
                Loaded::Undecodable(path)
            }
        }
    }

    /// Remove the node at `path` if it still belongs to `key` and is either
    /// undecodable or expired at `now`. The caller holds the key's stripe.
    async fn remove_if_stale(&self, path: &NodePath, key: &CacheKey, now: OffsetDateTime) -> bool {
        let node = match self.substrate.read_node(path).await {
            Ok(Some(node)) => node,
            Ok(None) => return false,
            Err(error) => {
                debug!(store = %self.settings.name, node = %path, error = %error, "stale entry unreadable");
                return false;
            }
        };
        let hash = key.hash_hex().as_bytes();
        if !node.property(KEY_HASH_PROPERTY).is_some_and(|stored| stored.as_ref() == hash) {
            return false;
        }
        let body_len = match StoredEntry::decode(node) {
            Ok(entry) if entry.key != *key || !entry.meta.is_expired(now) => return false,
            Ok(entry) => entry.meta.body_len,
            Err(_) => 0,
        };
        self.remove_node(path, body_len).await
    }

    /// Delete an entry node and hand its slot back. Failures are logged.
    async fn remove_node(&self, path: &NodePath, body_len: u64) -> bool {
        if let Err(error) = self.substrate.delete_subtree(path).await {
            warn!(store = %self.settings.name, node = %path, error = %error, "failed to delete entry");
            return false;
        }
        if let Some(slot) = self.slot_of(path) {
            mutex_lock(&self.allocator, SOURCE, "release").release(slot);
        }
        self.stats.adjust_occupancy(-1, -(body_len as i64));
        true
    }

    async fn remove_entry(&self, entry: &StoredEntry) -> bool {
        self.remove_node(&entry.path, entry.meta.body_len).await
    }

    /// Move the deadline of the entry at `path`, re-reading it first so a
    /// concurrent replacement or slot reuse is never overwritten. The caller
    /// holds the key's stripe.
    async fn refresh(
        &self,
        key: &CacheKey,
        path: &NodePath,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<(), StoreError> {
        let Some(node) = self.substrate.read_node(path).await? else {
            return Ok(());
        };
        let mut current = StoredEntry::decode(node)?;
        if current.key != *key {
            debug!(store = %self.settings.name, key = %key, "slot reused before its access refresh");
            return Ok(());
        }
        current.meta.expires_at = expires_at;
        let properties = StoredEntry::encode(key, &current.meta, current.body)?;
        self.substrate.write_node(path, &properties).await?;
        Ok(())
    }

    fn deadline(expiry: Expiry, now: OffsetDateTime, current: Option<OffsetDateTime>) -> Option<OffsetDateTime> {
        match expiry {
            Expiry::After(ttl) => after(now, ttl),
            Expiry::Never => None,
            Expiry::Unchanged => current,
        }
    }

    /// Write into a fresh slot, creating its bucket chain.
    async fn insert(&self, properties: &[(String, Bytes)]) -> Result<(), StoreError> {
        let slot = mutex_lock(&self.allocator, SOURCE, "reserve")
            .reserve()
            .ok_or_else(|| StoreError::Full {
                store: self.settings.name.clone(),
                capacity: self.layout.capacity(),
            })?;

        let segments = self.layout.slot_path(slot);
        let path = self.buckets.join(&segments);
        let written = async {
            if let Some(bucket) = path.parent() {
                self.substrate.create_container(&bucket).await?;
            }
            self.substrate.write_node(&path, properties).await
        }
        .await;

        if let Err(error) = written {
            mutex_lock(&self.allocator, SOURCE, "release").release(slot);
            return Err(error.into());
        }
        Ok(())
    }

    /// Load a live entry. Expired and undecodable entries are removed under
    /// the key's stripe and read as absent.
    async fn read_live(&self, key: &CacheKey, now: OffsetDateTime) -> Option<StoredEntry> {
        let stale = match self.load(key).await {
            Loaded::Entry(entry) if !entry.meta.is_expired(now) => return Some(entry),
            Loaded::Entry(entry) => {
                debug!(store = %self.settings.name, key = %key, "entry expired");
                entry.path
            }
            Loaded::Undecodable(path) => path,
            Loaded::Absent => return None,
        };
        let _guard = self.stripe(key.hash_hex()).lock().await;
        self.remove_if_stale(&stale, key, now).await;
        None
    }
}

/// Outcome of looking a key up in the tree.
enum Loaded {
    Entry(StoredEntry),
    Undecodable(NodePath),
    Absent,
}

/// `now + ttl`, or no deadline when the sum is not representable.
fn after(now: OffsetDateTime, ttl: std::time::Duration) -> Option<OffsetDateTime> {
    let deadline = time::Duration::try_from(ttl)
        .ok()
        .and_then(|ttl| now.checked_add(ttl));
    if deadline.is_none() {
        debug!(ttl_secs = ttl.as_secs(), "ttl past the representable range, entry never expires");
    }
    deadline
}

async fn write_layout(
    substrate: &dyn TreeSubstrate,
    root: &NodePath,
    layout: &BucketLayout,
) -> Result<(), StoreError> {
    substrate.create_container(root).await?;
    let properties = [(LAYOUT_PROPERTY.to_string(), Bytes::from(serde_json::to_vec(layout)?))];
    substrate.write_node(&root.child(LAYOUT_NODE), &properties).await?;
    Ok(())
}

#[async_trait]
impl CacheStore for PersistentStore {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn put(&self, key: CacheKey, content: CacheContent) -> Result<(), StoreError> {
        let body = content.payload().load().await?;
        let _guard = self.stripe(key.hash_hex()).lock().await;
        let now = OffsetDateTime::now_utc();

        let existing = match self.locate(&key).await? {
            Some(node) => {
                let path = node.path.clone();
                match StoredEntry::decode(node) {
                    Ok(entry) => Some(entry),
                    Err(error) => {
                        debug!(node = %path, error = %error, "replacing undecodable entry");
                        self.remove_node(&path, 0).await;
                        None
                    }
                }
            }
            None => None,
        };
        let live = existing.as_ref().filter(|entry| !entry.meta.is_expired(now));

        let expiry = match live {
            Some(_) => self.settings.expiry.for_update(&key),
            None => self.settings.expiry.for_creation(&key),
        };
        let meta = StoredMeta {
            content: content.meta().clone(),
            body_len: body.len() as u64,
            stored_at: now,
            expires_at: Self::deadline(expiry, now, live.and_then(|entry| entry.meta.expires_at)),
        };
        let properties = StoredEntry::encode(&key, &meta, body)?;

        match existing {
            Some(previous) => {
                self.substrate.write_node(&previous.path, &properties).await?;
                self.stats
                    .adjust_occupancy(0, meta.body_len as i64 - previous.meta.body_len as i64);
            }
            None => {
                self.insert(&properties).await?;
                self.stats.adjust_occupancy(1, meta.body_len as i64);
            }
        }
        self.stats.record_put();
        Ok(())
    }

    async fn contains(&self, key: &CacheKey) -> bool {
        self.read_live(key, OffsetDateTime::now_utc()).await.is_some()
    }

    async fn get(&self, key: &CacheKey) -> Option<CacheContent> {
        let now = OffsetDateTime::now_utc();
        let Some(entry) = self.read_live(key, now).await else {
            self.stats.record_miss();
            return None;
        };

        if let Expiry::After(ttl) = self.settings.expiry.for_access(key) {
            let _guard = self.stripe(key.hash_hex()).lock().await;
            if let Err(error) = self.refresh(key, &entry.path, after(now, ttl)).await {
                debug!(store = %self.settings.name, key = %key, error = %error, "access expiry not refreshed");
            }
        }

        self.stats.record_hit();
        Some(entry.into_content())
    }

    async fn peek(&self, key: &CacheKey) -> Option<CacheContent> {
        self.read_live(key, OffsetDateTime::now_utc())
            .await
            .map(StoredEntry::into_content)
    }

    async fn invalidate(&self, key: &CacheKey) {
        let _guard = self.stripe(key.hash_hex()).lock().await;
        let removed = match self.load(key).await {
            Loaded::Entry(entry) => self.remove_entry(&entry).await,
            Loaded::Undecodable(path) => self.remove_node(&path, 0).await,
            Loaded::Absent => false,
        };
        if removed {
            self.stats.record_invalidations(1);
        }
    }

    async fn invalidate_matching(&self, rule: &dyn InvalidationRule) -> usize {
        let entries = match self.walk().await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(store = %self.settings.name, error = %error, "invalidation walk failed");
                return 0;
            }
        };

        let mut removed = 0;
        for (_, path) in entries {
            let key = match self.substrate.read_property(&path, KEY_PROPERTY).await {
                Ok(Some(raw)) => match serde_json::from_slice::<CacheKey>(&raw) {
                    Ok(key) => key,
                    Err(error) => {
                        warn!(node = %path, error = %error, "skipping entry with undecodable key");
                        continue;
                    }
                },
                Ok(None) => continue,
                Err(error) => {
                    warn!(node = %path, error = %error, "failed to read entry key");
                    continue;
                }
            };
            if !rule.knows_key(&key) {
                continue;
            }

            let _guard = self.stripe(key.hash_hex()).lock().await;
            let body_len = match self.substrate.read_node(&path).await {
                Ok(Some(node)) => match StoredEntry::decode(node) {
                    Ok(entry) if entry.key == key => entry.meta.body_len,
                    // Slot was reused for another key since the walk.
                    Ok(_) => continue,
                    Err(_) => 0,
                },
                _ => continue,
            };
            if self.remove_node(&path, body_len).await {
                removed += 1;
            }
        }

        self.stats.record_invalidations(removed as u64);
        removed
    }

    async fn invalidate_all(&self) {
        let mut guards = Vec::with_capacity(self.stripes.len());
        for stripe in &self.stripes {
            guards.push(stripe.lock().await);
        }

        if let Err(error) = self.substrate.delete_subtree(&self.buckets).await {
            warn!(store = %self.settings.name, error = %error, "failed to clear store");
            return;
        }
        *mutex_lock(&self.allocator, SOURCE, "invalidate_all") = SlotAllocator::recover(&self.layout, &[]);
        self.stats.reset();
    }

    async fn size(&self) -> usize {
        self.stats.entries() as usize
    }

    async fn purge_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let Ok(entries) = self.walk().await else {
            return 0;
        };
        let mut purged = 0;
        for (_, path) in entries {
            let Ok(Some(node)) = self.substrate.read_node(&path).await else {
                continue;
            };
            let Ok(entry) = StoredEntry::decode(node) else {
                continue;
            };
            if entry.meta.is_expired(now) {
                let _guard = self.stripe(entry.key.hash_hex()).lock().await;
                if self.remove_if_stale(&path, &entry.key, now).await {
                    purged += 1;
                }
            }
        }
        purged
    }

    async fn keys(&self) -> Vec<CacheKey> {
        let now = OffsetDateTime::now_utc();
        let Ok(entries) = self.walk().await else {
            return Vec::new();
        };
        let mut keys = Vec::with_capacity(entries.len());
        for (_, path) in entries {
            if let Ok(Some(node)) = self.substrate.read_node(&path).await
                && let Ok(entry) = StoredEntry::decode(node)
                && !entry.meta.is_expired(now)
            {
                keys.push(entry.key);
            }
        }
        keys
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn create_sink(&self) -> Result<Box<dyn CaptureSink>, StoreError> {
        Ok(Box::new(SpoolSink::new(
            self.settings.spool_threshold,
            self.settings.capture_limit_bytes,
            self.settings.spool_dir.clone(),
        )))
    }
}
