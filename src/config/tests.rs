use config::FileFormat;

use super::*;

fn raw_from_toml(source: &str) -> RawSettings {
    Config::builder()
        .add_source(File::from_str(source, FileFormat::Toml))
        .build()
        .expect("config builds")
        .try_deserialize()
        .expect("raw settings")
}

fn invalid_key(result: Result<Settings, LoadError>) -> &'static str {
    match result {
        Err(LoadError::Invalid { key, .. }) => key,
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("settings unexpectedly valid"),
    }
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.public_port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.cache.enabled = Some(true);

    let overrides = ServeOverrides {
        public_port: Some(4321),
        log_level: Some("debug".to_string()),
        cache_enabled: Some(false),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.public_addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(!settings.cache.enabled);
}

#[test]
fn defaults_provide_a_memory_store_and_no_rules() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert!(settings.cache.enabled);
    assert_eq!(settings.cache.purge_interval, Duration::from_secs(DEFAULT_PURGE_INTERVAL_SECS));
    assert!(settings.cache.rules.is_empty());
    let store = settings.cache.store(DEFAULT_STORE_NAME).expect("default store");
    assert!(matches!(
        store.kind,
        StoreKind::Memory { max_entries, .. } if max_entries.get() == DEFAULT_MEMORY_MAX_ENTRIES
    ));
    assert_eq!(settings.content.root, PathBuf::from(DEFAULT_CONTENT_ROOT));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn rule_and_store_tables_are_parsed() {
    let raw = raw_from_toml(
        r#"
        [[cache.stores]]
        name = "memory"
        max_entries = 50
        ttl = "10m"

        [[cache.stores]]
        name = "disk"
        kind = "persistent"
        directory = "/var/cache/strata"
        bucket_size = 3
        expected_entries = 7
        ttl = 3600

        [[cache.rules]]
        id = "docs"
        store = "disk"
        rank = 10
        patterns = ["/docs/**"]
        extensions = ["html"]
        query_params = ["page"]
        key_headers = ["Accept-Language"]
        user_group_header = "x-user-group"
        anonymous_group = "anonymous"
        ttl = "1h"
        access_ttl = "5m"
        exclude_headers = ["x-request-id"]
        statuses = [200, 404]
        max_body_bytes = 1048576
        "#,
    );

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.stores.len(), 2);

    let memory = settings.cache.store("memory").expect("memory store");
    assert_eq!(memory.expiry.ttl, Some(Duration::from_secs(600)));

    let disk = settings.cache.store("disk").expect("disk store");
    assert_eq!(disk.expiry.ttl, Some(Duration::from_secs(3600)));
    match &disk.kind {
        StoreKind::Persistent {
            directory,
            bucket_size,
            expected_entries,
            ..
        } => {
            assert_eq!(directory, &PathBuf::from("/var/cache/strata"));
            assert_eq!(*bucket_size, 3);
            assert_eq!(*expected_entries, 7);
        }
        StoreKind::Memory { .. } => panic!("expected a persistent store"),
    }

    let rule = &settings.cache.rules[0];
    assert_eq!(rule.id, "docs");
    assert_eq!(rule.rank, 10);
    assert_eq!(rule.methods, [Method::GET]);
    assert_eq!(rule.scope, ScopeFilter::Request);
    assert_eq!(rule.key_headers, [HeaderName::from_static("accept-language")]);
    assert_eq!(rule.statuses, [StatusCode::OK, StatusCode::NOT_FOUND]);
    assert_eq!(rule.expiry.creation, Some(Duration::from_secs(3600)));
    assert_eq!(rule.expiry.access, Some(Duration::from_secs(300)));
    assert_eq!(rule.expiry.update, None);
}

#[test]
fn rules_must_reference_declared_stores() {
    let raw = raw_from_toml(
        r#"
        [[cache.rules]]
        id = "pages"
        store = "nowhere"
        "#,
    );
    assert_eq!(invalid_key(Settings::from_raw(raw)), "cache.rules.store");
}

#[test]
fn duplicate_rule_ids_are_rejected() {
    let raw = raw_from_toml(
        r#"
        [[cache.rules]]
        id = "pages"

        [[cache.rules]]
        id = "pages"
        "#,
    );
    assert_eq!(invalid_key(Settings::from_raw(raw)), "cache.rules.id");
}

#[test]
fn persistent_stores_need_a_directory() {
    let raw = raw_from_toml(
        r#"
        [[cache.stores]]
        name = "disk"
        kind = "persistent"
        "#,
    );
    assert_eq!(invalid_key(Settings::from_raw(raw)), "cache.stores.directory");
}

#[test]
fn malformed_ttls_are_rejected_and_never_is_unset() {
    let raw = raw_from_toml(
        r#"
        [[cache.stores]]
        name = "memory"
        ttl = "soon"
        "#,
    );
    assert_eq!(invalid_key(Settings::from_raw(raw)), "cache.stores.ttl");

    let raw = raw_from_toml(
        r#"
        [[cache.stores]]
        name = "memory"
        ttl = "never"
        access_ttl = 0
        "#,
    );
    let settings = Settings::from_raw(raw).expect("valid settings");
    let store = settings.cache.store("memory").expect("store");
    assert_eq!(store.expiry.ttl, None);
    assert_eq!(store.expiry.access_ttl, None);
}

#[test]
fn unknown_scope_is_rejected() {
    let raw = raw_from_toml(
        r#"
        [[cache.rules]]
        id = "fragments"
        scope = "partial"
        "#,
    );
    assert_eq!(invalid_key(Settings::from_raw(raw)), "cache.rules.scope");
}

#[test]
fn zero_purge_interval_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.purge_interval_seconds = Some(0);
    assert_eq!(
        invalid_key(Settings::from_raw(raw)),
        "cache.purge_interval_seconds"
    );
}

#[test]
fn shared_listener_addresses_are_rejected() {
    let mut raw = RawSettings::default();
    raw.server.public_port = Some(4000);
    raw.server.admin_port = Some(4000);
    assert_eq!(invalid_key(Settings::from_raw(raw)), "server.admin_port");
}
