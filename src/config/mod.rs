//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::HashSet,
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use axum::http::{HeaderName, Method, StatusCode};
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{ExpiryPolicy, KeyExpiry, ScopeFilter, TtlLiteral, parse_ttl};

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides, StoreArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "strata";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CONTENT_ROOT: &str = "public";
const DEFAULT_INDEX_FILE: &str = "index.html";
const DEFAULT_PURGE_INTERVAL_SECS: u64 = 60;
const DEFAULT_STORE_NAME: &str = "memory";
const DEFAULT_MEMORY_MAX_ENTRIES: usize = 1_000;
const DEFAULT_BUCKET_SIZE: u32 = 256;
const DEFAULT_EXPECTED_ENTRIES: u64 = 100_000;
const DEFAULT_SPOOL_THRESHOLD_BYTES: usize = 64 * 1024;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub content: ContentSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct ContentSettings {
    pub root: PathBuf,
    /// File served for directory paths.
    pub index_file: String,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub purge_interval: Duration,
    pub stores: Vec<StoreSettings>,
    pub rules: Vec<RuleSettings>,
}

impl CacheSettings {
    pub fn store(&self, name: &str) -> Option<&StoreSettings> {
        self.stores.iter().find(|store| store.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub name: String,
    pub kind: StoreKind,
    pub expiry: ExpiryPolicy,
    pub capture_limit_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum StoreKind {
    Memory {
        max_entries: NonZeroUsize,
        max_bytes: Option<u64>,
    },
    Persistent {
        directory: PathBuf,
        bucket_size: u32,
        expected_entries: u64,
        spool_threshold: usize,
    },
}

/// One `[[cache.rules]]` table, validated.
#[derive(Debug, Clone)]
pub struct RuleSettings {
    pub id: String,
    pub store: String,
    pub rank: i32,
    pub patterns: Vec<String>,
    pub methods: Vec<Method>,
    pub scope: ScopeFilter,
    pub extensions: Vec<String>,
    pub query_params: Vec<String>,
    pub allow_unlisted_query: bool,
    pub key_headers: Vec<HeaderName>,
    pub user_group_header: Option<HeaderName>,
    pub anonymous_group: Option<String>,
    pub expiry: KeyExpiry,
    pub exclude_headers: Vec<HeaderName>,
    pub statuses: Vec<StatusCode>,
    pub max_body_bytes: Option<u64>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("STRATA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Inspect(_)) | Some(Command::Clear(_)) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    content: RawContentSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(root) = overrides.content_root.as_ref() {
            self.content.root = Some(root.clone());
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(seconds) = overrides.cache_purge_interval_seconds {
            self.cache.purge_interval_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            content,
            cache,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            content: build_content_settings(content)?,
            cache: build_cache_settings(cache)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;
    if public_addr == admin_addr {
        return Err(LoadError::invalid(
            "server.admin_port",
            "admin listener must not share the public address",
        ));
    }

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_content_settings(content: RawContentSettings) -> Result<ContentSettings, LoadError> {
    let root = content
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTENT_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid("content.root", "path must not be empty"));
    }

    let index_file = content
        .index_file
        .unwrap_or_else(|| DEFAULT_INDEX_FILE.to_string());
    if index_file.is_empty() || index_file.contains('/') {
        return Err(LoadError::invalid(
            "content.index_file",
            "must be a plain file name",
        ));
    }

    Ok(ContentSettings { root, index_file })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let purge_secs = cache
        .purge_interval_seconds
        .unwrap_or(DEFAULT_PURGE_INTERVAL_SECS);
    if purge_secs == 0 {
        return Err(LoadError::invalid(
            "cache.purge_interval_seconds",
            "must be greater than zero",
        ));
    }

    let mut stores = cache
        .stores
        .into_iter()
        .map(build_store_settings)
        .collect::<Result<Vec<_>, _>>()?;
    if stores.is_empty() {
        stores.push(default_store());
    }

    let mut names = HashSet::new();
    for store in &stores {
        if !names.insert(store.name.as_str()) {
            return Err(LoadError::invalid(
                "cache.stores.name",
                format!("store `{}` is declared twice", store.name),
            ));
        }
    }

    let rules = cache
        .rules
        .into_iter()
        .map(build_rule_settings)
        .collect::<Result<Vec<_>, _>>()?;

    let mut ids = HashSet::new();
    for rule in &rules {
        if !ids.insert(rule.id.as_str()) {
            return Err(LoadError::invalid(
                "cache.rules.id",
                format!("rule `{}` is declared twice", rule.id),
            ));
        }
        if !names.contains(rule.store.as_str()) {
            return Err(LoadError::invalid(
                "cache.rules.store",
                format!("rule `{}` references unknown store `{}`", rule.id, rule.store),
            ));
        }
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        purge_interval: Duration::from_secs(purge_secs),
        stores,
        rules,
    })
}

fn default_store() -> StoreSettings {
    StoreSettings {
        name: DEFAULT_STORE_NAME.to_string(),
        kind: StoreKind::Memory {
            max_entries: NonZeroUsize::new(DEFAULT_MEMORY_MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN),
            max_bytes: None,
        },
        expiry: ExpiryPolicy::default(),
        capture_limit_bytes: None,
    }
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let name = non_empty(store.name, "cache.stores.name")?;
    let expiry = ExpiryPolicy {
        ttl: ttl(store.ttl, "cache.stores.ttl")?,
        access_ttl: ttl(store.access_ttl, "cache.stores.access_ttl")?,
        update_ttl: ttl(store.update_ttl, "cache.stores.update_ttl")?,
    };

    let kind = match store.kind.as_deref().unwrap_or("memory") {
        "memory" => {
            let max_entries = store.max_entries.unwrap_or(DEFAULT_MEMORY_MAX_ENTRIES);
            let max_entries = NonZeroUsize::new(max_entries).ok_or_else(|| {
                LoadError::invalid("cache.stores.max_entries", "must be greater than zero")
            })?;
            StoreKind::Memory {
                max_entries,
                max_bytes: store.max_bytes,
            }
        }
        "persistent" => {
            let directory = store.directory.ok_or_else(|| {
                LoadError::invalid(
                    "cache.stores.directory",
                    format!("persistent store `{name}` needs a directory"),
                )
            })?;
            let bucket_size = store.bucket_size.unwrap_or(DEFAULT_BUCKET_SIZE);
            if bucket_size < 2 {
                return Err(LoadError::invalid(
                    "cache.stores.bucket_size",
                    "must be at least 2",
                ));
            }
            let expected_entries = store.expected_entries.unwrap_or(DEFAULT_EXPECTED_ENTRIES);
            if expected_entries == 0 {
                return Err(LoadError::invalid(
                    "cache.stores.expected_entries",
                    "must be greater than zero",
                ));
            }
            StoreKind::Persistent {
                directory,
                bucket_size,
                expected_entries,
                spool_threshold: store
                    .spool_threshold_bytes
                    .unwrap_or(DEFAULT_SPOOL_THRESHOLD_BYTES),
            }
        }
        other => {
            return Err(LoadError::invalid(
                "cache.stores.kind",
                format!("unknown store kind `{other}`, expected `memory` or `persistent`"),
            ));
        }
    };

    Ok(StoreSettings {
        name,
        kind,
        expiry,
        capture_limit_bytes: store.capture_limit_bytes,
    })
}

fn build_rule_settings(rule: RawRuleSettings) -> Result<RuleSettings, LoadError> {
    let id = non_empty(rule.id, "cache.rules.id")?;
    let store = rule
        .store
        .unwrap_or_else(|| DEFAULT_STORE_NAME.to_string());

    for pattern in &rule.patterns {
        if !pattern.starts_with('/') {
            return Err(LoadError::invalid(
                "cache.rules.patterns",
                format!("pattern `{pattern}` must start with `/`"),
            ));
        }
    }

    let methods = if rule.methods.is_empty() {
        vec![Method::GET]
    } else {
        rule.methods
            .iter()
            .map(|method| {
                Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|_| {
                    LoadError::invalid("cache.rules.methods", format!("invalid method `{method}`"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    let scope = match rule.scope.as_deref().unwrap_or("request") {
        "request" => ScopeFilter::Request,
        "include" => ScopeFilter::Include,
        "any" => ScopeFilter::Any,
        other => {
            return Err(LoadError::invalid(
                "cache.rules.scope",
                format!("unknown scope `{other}`, expected `request`, `include` or `any`"),
            ));
        }
    };

    let key_headers = header_names(&rule.key_headers, "cache.rules.key_headers")?;
    let exclude_headers = header_names(&rule.exclude_headers, "cache.rules.exclude_headers")?;
    let user_group_header = rule
        .user_group_header
        .as_deref()
        .map(|name| header_name(name, "cache.rules.user_group_header"))
        .transpose()?;

    let statuses = if rule.statuses.is_empty() {
        vec![StatusCode::OK]
    } else {
        rule.statuses
            .iter()
            .map(|status| {
                StatusCode::from_u16(*status).map_err(|_| {
                    LoadError::invalid("cache.rules.statuses", format!("invalid status `{status}`"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    let expiry = KeyExpiry {
        creation: ttl(rule.ttl, "cache.rules.ttl")?,
        access: ttl(rule.access_ttl, "cache.rules.access_ttl")?,
        update: ttl(rule.update_ttl, "cache.rules.update_ttl")?,
    };

    Ok(RuleSettings {
        id,
        store,
        rank: rule.rank.unwrap_or(0),
        patterns: rule.patterns,
        methods,
        scope,
        extensions: rule.extensions,
        query_params: rule.query_params,
        allow_unlisted_query: rule.allow_unlisted_query.unwrap_or(false),
        key_headers,
        user_group_header,
        anonymous_group: rule.anonymous_group,
        expiry,
        exclude_headers,
        statuses,
        max_body_bytes: rule.max_body_bytes,
    })
}

fn non_empty(value: Option<String>, key: &'static str) -> Result<String, LoadError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LoadError::invalid(key, "must not be empty"))
}

/// Zero, `never` and an empty string mean "no TTL"; anything else must parse.
fn ttl(literal: Option<TtlLiteral>, key: &'static str) -> Result<Option<Duration>, LoadError> {
    match literal {
        None => Ok(None),
        Some(TtlLiteral::Seconds(secs)) if secs < 0 => {
            Err(LoadError::invalid(key, "must not be negative"))
        }
        Some(literal @ TtlLiteral::Seconds(_)) => Ok(literal.resolve()),
        Some(TtlLiteral::Text(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed == "0" || trimmed.eq_ignore_ascii_case("never") {
                return Ok(None);
            }
            parse_ttl(trimmed)
                .map(Some)
                .ok_or_else(|| LoadError::invalid(key, format!("invalid duration `{text}`")))
        }
    }
}

fn header_name(name: &str, key: &'static str) -> Result<HeaderName, LoadError> {
    HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes())
        .map_err(|_| LoadError::invalid(key, format!("invalid header name `{name}`")))
}

fn header_names(names: &[String], key: &'static str) -> Result<Vec<HeaderName>, LoadError> {
    names.iter().map(|name| header_name(name, key)).collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawContentSettings {
    root: Option<PathBuf>,
    index_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    purge_interval_seconds: Option<u64>,
    stores: Vec<RawStoreSettings>,
    rules: Vec<RawRuleSettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    name: Option<String>,
    kind: Option<String>,
    ttl: Option<TtlLiteral>,
    access_ttl: Option<TtlLiteral>,
    update_ttl: Option<TtlLiteral>,
    capture_limit_bytes: Option<u64>,
    max_entries: Option<usize>,
    max_bytes: Option<u64>,
    directory: Option<PathBuf>,
    bucket_size: Option<u32>,
    expected_entries: Option<u64>,
    spool_threshold_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRuleSettings {
    id: Option<String>,
    store: Option<String>,
    rank: Option<i32>,
    patterns: Vec<String>,
    methods: Vec<String>,
    scope: Option<String>,
    extensions: Vec<String>,
    query_params: Vec<String>,
    allow_unlisted_query: Option<bool>,
    key_headers: Vec<String>,
    user_group_header: Option<String>,
    anonymous_group: Option<String>,
    ttl: Option<TtlLiteral>,
    access_ttl: Option<TtlLiteral>,
    update_ttl: Option<TtlLiteral>,
    exclude_headers: Vec<String>,
    statuses: Vec<u16>,
    max_body_bytes: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

#[cfg(test)]
mod tests;
