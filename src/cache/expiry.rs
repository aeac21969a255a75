//! Expiry resolution shared by every store.

use std::time::Duration;

use serde::Deserialize;

use super::keys::CacheKey;

/// Store-wide TTL defaults. Each event falls back independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// TTL applied when an entry is created.
    pub ttl: Option<Duration>,
    /// TTL re-applied on every hit; `None` leaves the deadline untouched.
    pub access_ttl: Option<Duration>,
    /// TTL applied when an existing entry is replaced; `None` falls back to `ttl`.
    pub update_ttl: Option<Duration>,
}

/// Deadline change requested by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Expire after the given duration.
    After(Duration),
    /// Never expire.
    Never,
    /// Keep whatever deadline the entry already has.
    Unchanged,
}

impl ExpiryPolicy {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    /// Override if set, else a positive store default, else non-expiring.
    pub fn duration_for(key_override: Option<Duration>, store_default: Option<Duration>) -> Option<Duration> {
        key_override
            .filter(|ttl| !ttl.is_zero())
            .or_else(|| store_default.filter(|ttl| !ttl.is_zero()))
    }

    pub fn for_creation(&self, key: &CacheKey) -> Expiry {
        match Self::duration_for(key.expiry_for_creation(), self.ttl) {
            Some(ttl) => Expiry::After(ttl),
            None => Expiry::Never,
        }
    }

    pub fn for_update(&self, key: &CacheKey) -> Expiry {
        let key_override = key.expiry_for_update().or(key.expiry_for_creation());
        match Self::duration_for(key_override, self.update_ttl.or(self.ttl)) {
            Some(ttl) => Expiry::After(ttl),
            None => Expiry::Never,
        }
    }

    pub fn for_access(&self, key: &CacheKey) -> Expiry {
        match Self::duration_for(key.expiry_for_access(), self.access_ttl) {
            Some(ttl) => Expiry::After(ttl),
            None => Expiry::Unchanged,
        }
    }
}

/// Parse a TTL literal such as `250ms`, `30s`, `5m`, `2h`, `1d` or a bare
/// number of seconds. Anything malformed, zero or negative is unset.
pub fn parse_ttl(literal: &str) -> Option<Duration> {
    let literal = literal.trim();
    if literal.is_empty() {
        return None;
    }

    let split_at = literal
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(literal.len());
    let (digits, unit) = literal.split_at(split_at);
    let amount: u64 = digits.parse().ok()?;
    if amount == 0 {
        return None;
    }

    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(amount),
        "ms" => Duration::from_millis(amount),
        "m" => Duration::from_secs(amount.checked_mul(60)?),
        "h" => Duration::from_secs(amount.checked_mul(60 * 60)?),
        "d" => Duration::from_secs(amount.checked_mul(24 * 60 * 60)?),
        _ => return None,
    };
    Some(duration)
}

/// TTL as it appears in settings files: a literal or an integer of seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TtlLiteral {
    Seconds(i64),
    Text(String),
}

impl TtlLiteral {
    pub fn resolve(&self) -> Option<Duration> {
        match self {
            TtlLiteral::Seconds(secs) if *secs > 0 => Some(Duration::from_secs(*secs as u64)),
            TtlLiteral::Seconds(_) => None,
            TtlLiteral::Text(text) => parse_ttl(text),
        }
    }
}
