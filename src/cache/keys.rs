//! Cache key definitions.
//!
//! A [`CacheKey`] is the fingerprint of a request as seen by one cache config.
//! Identity (equality, hashing, the stored `key_hash`) is derived from the
//! canonical raw form only; per-key expiry overrides ride along but never
//! change which entry a key addresses.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reasons a request cannot be turned into a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("cache key requires a config id")]
    EmptyConfigId,
    #[error("resource path `{0}` is not absolute")]
    InvalidPath(String),
    #[error("required key component `{0}` is missing from the request")]
    MissingComponent(String),
}

/// Optional per-key TTL overrides. `None` defers to the store default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExpiry {
    pub creation: Option<Duration>,
    pub access: Option<Duration>,
    pub update: Option<Duration>,
}

impl KeyExpiry {
    pub fn is_empty(&self) -> bool {
        self.creation.is_none() && self.access.is_none() && self.update.is_none()
    }
}

/// Immutable request fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "KeyRecord", into = "KeyRecord")]
pub struct CacheKey {
    config_id: String,
    method: String,
    resource_path: String,
    selectors: Vec<String>,
    extension: Option<String>,
    components: BTreeMap<String, Vec<String>>,
    expiry: KeyExpiry,
    raw: String,
    hash: String,
}

impl CacheKey {
    pub fn builder(config_id: impl Into<String>, resource_path: impl Into<String>) -> KeyBuilder {
        KeyBuilder {
            config_id: config_id.into(),
            method: "GET".to_string(),
            resource_path: resource_path.into(),
            selectors: Vec::new(),
            extension: None,
            components: BTreeMap::new(),
            expiry: KeyExpiry::default(),
        }
    }

    /// Canonical string form, used for debugging and as the hash input.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Hex SHA-256 of [`CacheKey::raw`].
    pub fn hash_hex(&self) -> &str {
        &self.hash
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }

    pub fn selectors(&self) -> &[String] {
        &self.selectors
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    pub fn component(&self, name: &str) -> Option<&[String]> {
        self.components.get(name).map(Vec::as_slice)
    }

    pub fn expiry_for_creation(&self) -> Option<Duration> {
        self.expiry.creation
    }

    pub fn expiry_for_access(&self) -> Option<Duration> {
        self.expiry.access
    }

    pub fn expiry_for_update(&self) -> Option<Duration> {
        self.expiry.update
    }

    fn from_parts(record: KeyRecord) -> Self {
        let raw = render_raw(&record);
        let hash = hex::encode(Sha256::digest(raw.as_bytes()));
        Self {
            config_id: record.config_id,
            method: record.method,
            resource_path: record.resource_path,
            selectors: record.selectors,
            extension: record.extension,
            components: record.components,
            expiry: sanitize_expiry(record.expiry),
            raw,
            hash,
        }
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Accumulates key components before the key is frozen.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    config_id: String,
    method: String,
    resource_path: String,
    selectors: Vec<String>,
    extension: Option<String>,
    components: BTreeMap<String, Vec<String>>,
    expiry: KeyExpiry,
}

impl KeyBuilder {
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into().to_ascii_uppercase();
        self
    }

    pub fn selectors<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selectors = selectors.into_iter().map(Into::into).collect();
        self
    }

    pub fn extension(mut self, extension: Option<impl Into<String>>) -> Self {
        self.extension = extension.map(Into::into);
        self
    }

    /// Add a component. Repeated calls for one name append values in order.
    pub fn component<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.components
            .entry(name.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn expiry(mut self, expiry: KeyExpiry) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn build(self) -> Result<CacheKey, KeyError> {
        if self.config_id.trim().is_empty() {
            return Err(KeyError::EmptyConfigId);
        }
        if !self.resource_path.starts_with('/') {
            return Err(KeyError::InvalidPath(self.resource_path));
        }

        Ok(CacheKey::from_parts(KeyRecord {
            config_id: self.config_id,
            method: self.method,
            resource_path: self.resource_path,
            selectors: self.selectors,
            extension: self.extension,
            components: self.components,
            expiry: self.expiry,
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRecord {
    config_id: String,
    method: String,
    resource_path: String,
    #[serde(default)]
    selectors: Vec<String>,
    #[serde(default)]
    extension: Option<String>,
    #[serde(default)]
    components: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    expiry: KeyExpiry,
}

impl From<KeyRecord> for CacheKey {
    fn from(record: KeyRecord) -> Self {
        CacheKey::from_parts(record)
    }
}

impl From<CacheKey> for KeyRecord {
    fn from(key: CacheKey) -> Self {
        Self {
            config_id: key.config_id,
            method: key.method,
            resource_path: key.resource_path,
            selectors: key.selectors,
            extension: key.extension,
            components: key.components,
            expiry: key.expiry,
        }
    }
}

// Zero durations would mean "expire immediately"; they are treated as unset.
fn sanitize_expiry(expiry: KeyExpiry) -> KeyExpiry {
    let keep = |ttl: Option<Duration>| ttl.filter(|value| !value.is_zero());
    KeyExpiry {
        creation: keep(expiry.creation),
        access: keep(expiry.access),
        update: keep(expiry.update),
    }
}

fn render_raw(record: &KeyRecord) -> String {
    let selectors = record
        .selectors
        .iter()
        .map(|selector| escape(selector))
        .collect::<Vec<_>>()
        .join(".");
    let extension = record.extension.as_deref().map(escape).unwrap_or_default();
    let components = record
        .components
        .iter()
        .map(|(name, values)| {
            let values = values.iter().map(|v| escape(v)).collect::<Vec<_>>();
            format!("{}={}", escape(name), values.join(","))
        })
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}|{}|{}|{}|{}|{}",
        escape(&record.config_id),
        record.method,
        escape(&record.resource_path),
        selectors,
        extension,
        components
    )
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            ',' => out.push_str("%2C"),
            '.' => out.push_str("%2E"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn key(path: &str) -> KeyBuilder {
        CacheKey::builder("pages", path)
    }

    #[test]
    fn equal_components_produce_equal_keys() {
        let a = key("/a")
            .component("lang", ["en"])
            .component("group", ["editors"])
            .build()
            .expect("key");
        let b = key("/a")
            .component("group", ["editors"])
            .component("lang", ["en"])
            .build()
            .expect("key");

        assert_eq!(a, b);
        assert_eq!(a.hash_hex(), b.hash_hex());

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn expiry_overrides_do_not_change_identity() {
        let plain = key("/a").build().expect("key");
        let with_ttl = key("/a")
            .expiry(KeyExpiry {
                creation: Some(Duration::from_secs(5)),
                ..Default::default()
            })
            .build()
            .expect("key");

        assert_eq!(plain, with_ttl);
        assert_eq!(with_ttl.expiry_for_creation(), Some(Duration::from_secs(5)));
        assert_eq!(plain.expiry_for_creation(), None);
    }

    #[test]
    fn zero_overrides_are_unset() {
        let key = key("/a")
            .expiry(KeyExpiry {
                creation: Some(Duration::ZERO),
                access: Some(Duration::from_secs(1)),
                update: None,
            })
            .build()
            .expect("key");

        assert_eq!(key.expiry_for_creation(), None);
        assert_eq!(key.expiry_for_access(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn separators_inside_values_cannot_forge_another_key() {
        let injected = key("/a")
            .component("q", ["1&r=2"])
            .build()
            .expect("key");
        let split = key("/a")
            .component("q", ["1"])
            .component("r", ["2"])
            .build()
            .expect("key");

        assert_ne!(injected, split);
    }

    #[test]
    fn selectors_and_extension_participate_in_identity() {
        let html = key("/a").extension(Some("html")).build().expect("key");
        let json = key("/a").extension(Some("json")).build().expect("key");
        let print = key("/a")
            .selectors(["print"])
            .extension(Some("html"))
            .build()
            .expect("key");

        assert_ne!(html, json);
        assert_ne!(html, print);
    }

    #[test]
    fn rejects_relative_paths_and_missing_config() {
        assert_eq!(
            CacheKey::builder("pages", "a").build(),
            Err(KeyError::InvalidPath("a".to_string()))
        );
        assert_eq!(
            CacheKey::builder(" ", "/a").build(),
            Err(KeyError::EmptyConfigId)
        );
    }

    #[test]
    fn serde_round_trip_restores_identity() {
        let original = key("/content/page")
            .selectors(["print"])
            .extension(Some("html"))
            .component("lang", ["de"])
            .expiry(KeyExpiry {
                access: Some(Duration::from_secs(30)),
                ..Default::default()
            })
            .build()
            .expect("key");

        let json = serde_json::to_string(&original).expect("serialize");
        let restored: CacheKey = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(restored, original);
        assert_eq!(restored.hash_hex(), original.hash_hex());
        assert_eq!(restored.expiry_for_access(), Some(Duration::from_secs(30)));
    }
}
