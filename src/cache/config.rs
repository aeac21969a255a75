//! Ranked cache rules.
//!
//! A [`CacheConfig`] decides which requests it owns, which store holds their
//! responses and how a request is folded into a [`CacheKey`]. [`RuleConfig`]
//! is the declarative implementation the server builds from its settings.

use std::fmt;

use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};

use super::keys::{CacheKey, KeyError, KeyExpiry};
use super::request::{CacheRequest, RequestScope};

/// A ranked cache rule. Higher rank is consulted first.
pub trait CacheConfig: Send + Sync {
    fn id(&self) -> &str;

    fn rank(&self) -> i32 {
        0
    }

    /// Name of the registered store this config caches into.
    fn store_name(&self) -> &str;

    /// Whether this config owns `request` when rendered in `scope`.
    fn accepts(&self, request: &CacheRequest, scope: RequestScope) -> bool;

    fn build_key(&self, request: &CacheRequest) -> Result<CacheKey, KeyError>;

    /// Whether `key` was built by this config. Used for bulk invalidation.
    fn knows_key(&self, key: &CacheKey) -> bool {
        key.config_id() == self.id()
    }

    /// Headers kept on the live response but never persisted.
    fn excluded_headers(&self) -> &[HeaderName] {
        &[]
    }

    fn cacheable_statuses(&self) -> &[StatusCode] {
        &[StatusCode::OK]
    }

    fn max_body_bytes(&self) -> Option<u64> {
        None
    }

    /// Final config-specific veto on a completed response.
    fn accepts_response(&self, _status: StatusCode, _headers: &HeaderMap) -> bool {
        true
    }
}

/// Scopes a rule applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScopeFilter {
    #[default]
    Request,
    Include,
    Any,
}

impl ScopeFilter {
    fn admits(self, scope: RequestScope) -> bool {
        match self {
            ScopeFilter::Any => true,
            ScopeFilter::Request => scope == RequestScope::Request,
            ScopeFilter::Include => scope == RequestScope::Include,
        }
    }
}

/// Path glob. `*` matches within one segment, `**` matches any number of
/// whole segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<String>,
}

impl PathPattern {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let segments = split_segments(&raw).map(str::to_string).collect();
        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        let path: Vec<&str> = split_segments(path).collect();
        let pattern: Vec<&str> = self.segments.iter().map(String::as_str).collect();
        match_segments(&pattern, &path)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(rest, &path[skip..])),
        Some((head, rest)) => match path.split_first() {
            Some((segment, remaining)) => {
                wildcard_match(head.as_bytes(), segment.as_bytes()) && match_segments(rest, remaining)
            }
            None => false,
        },
    }
}

fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|skip| wildcard_match(rest, &text[skip..])),
        Some((head, rest)) => text
            .split_first()
            .is_some_and(|(ch, remaining)| ch == head && wildcard_match(rest, remaining)),
    }
}

const COMPONENT_GROUP: &str = "group";

/// Declarative rule config.
#[derive(Debug, Clone)]
pub struct RuleConfig {
    id: String,
    rank: i32,
    store: String,
    patterns: Vec<PathPattern>,
    methods: Vec<Method>,
    scope: ScopeFilter,
    extensions: Vec<String>,
    query_params: Vec<String>,
    allow_unlisted_query: bool,
    key_headers: Vec<HeaderName>,
    user_group_header: Option<HeaderName>,
    anonymous_group: Option<String>,
    expiry: KeyExpiry,
    excluded_headers: Vec<HeaderName>,
    statuses: Vec<StatusCode>,
    max_body_bytes: Option<u64>,
}

impl RuleConfig {
    /// A rule matching every GET path, keyed on path, selectors and extension.
    pub fn new(id: impl Into<String>, store: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rank: 0,
            store: store.into(),
            patterns: Vec::new(),
            methods: vec![Method::GET],
            scope: ScopeFilter::Request,
            extensions: Vec::new(),
            query_params: Vec::new(),
            allow_unlisted_query: false,
            key_headers: Vec::new(),
            user_group_header: None,
            anonymous_group: None,
            expiry: KeyExpiry::default(),
            excluded_headers: Vec::new(),
            statuses: vec![StatusCode::OK],
            max_body_bytes: None,
        }
    }

    pub fn rank(mut self, rank: i32) -> Self {
        self.rank = rank;
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(PathPattern::new(pattern));
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn scope(mut self, scope: ScopeFilter) -> Self {
        self.scope = scope;
        self
    }

    pub fn extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|extension| extension.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Query parameters folded into the key. Requests carrying any other
    /// parameter are not cached unless `allow_unlisted` is set.
    pub fn query_params<I, S>(mut self, params: I, allow_unlisted: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query_params = params.into_iter().map(Into::into).collect();
        self.allow_unlisted_query = allow_unlisted;
        self
    }

    pub fn key_header(mut self, name: HeaderName) -> Self {
        self.key_headers.push(name);
        self
    }

    /// Vary entries by the user group carried in `header`. Requests without
    /// it use `anonymous`, or are not cacheable when that is `None`.
    pub fn user_group(mut self, header: HeaderName, anonymous: Option<String>) -> Self {
        self.user_group_header = Some(header);
        self.anonymous_group = anonymous;
        self
    }

    pub fn expiry(mut self, expiry: KeyExpiry) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn exclude_header(mut self, name: HeaderName) -> Self {
        if !self.excluded_headers.contains(&name) {
            self.excluded_headers.push(name);
        }
        self
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn max_body_bytes(mut self, limit: Option<u64>) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn patterns(&self) -> &[PathPattern] {
        &self.patterns
    }

    fn path_matches(&self, request: &CacheRequest) -> bool {
        self.patterns.is_empty()
            || self
                .patterns
                .iter()
                .any(|pattern| pattern.matches(request.path()))
    }

    fn query_acceptable(&self, request: &CacheRequest) -> bool {
        self.allow_unlisted_query
            || request
                .query_names()
                .all(|name| self.query_params.iter().any(|allowed| allowed == name))
    }
}

impl CacheConfig for RuleConfig {
    fn id(&self) -> &str {
        &self.id
    }

    fn rank(&self) -> i32 {
        self.rank
    }

    fn store_name(&self) -> &str {
        &self.store
    }

    fn accepts(&self, request: &CacheRequest, scope: RequestScope) -> bool {
        self.scope.admits(scope)
            && self.methods.contains(request.method())
            && (self.extensions.is_empty()
                || request.extension().is_some_and(|extension| {
                    self.extensions
                        .iter()
                        .any(|allowed| allowed.eq_ignore_ascii_case(extension))
                }))
            && self.path_matches(request)
            && self.query_acceptable(request)
    }

    fn build_key(&self, request: &CacheRequest) -> Result<CacheKey, KeyError> {
        let mut builder = CacheKey::builder(self.id.as_str(), request.resource_path())
            .method(request.method().as_str())
            .selectors(request.selectors().iter().cloned())
            .extension(request.extension())
            .expiry(self.expiry);

        for name in &self.query_params {
            let values: Vec<&str> = request.query_values(name).collect();
            if !values.is_empty() {
                builder = builder.component(format!("query:{name}"), values);
            }
        }

        for name in &self.key_headers {
            let values: Vec<&str> = request.header_values(name.as_str()).collect();
            if !values.is_empty() {
                builder = builder.component(format!("header:{name}"), values);
            }
        }

        if let Some(header) = &self.user_group_header {
            let group = request
                .header_values(header.as_str())
                .next()
                .map(str::to_string)
                .or_else(|| self.anonymous_group.clone())
                .ok_or_else(|| KeyError::MissingComponent(header.to_string()))?;
            builder = builder.component(COMPONENT_GROUP, [group]);
        }

        builder.build()
    }

    fn excluded_headers(&self) -> &[HeaderName] {
        &self.excluded_headers
    }

    fn cacheable_statuses(&self) -> &[StatusCode] {
        &self.statuses
    }

    fn max_body_bytes(&self) -> Option<u64> {
        self.max_body_bytes
    }

    fn accepts_response(&self, _status: StatusCode, headers: &HeaderMap) -> bool {
        // Personalised responses carry the header and are left alone.
        !headers
            .get_all(header::CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| {
                value
                    .split(',')
                    .any(|directive| directive.trim().eq_ignore_ascii_case("private"))
            })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn single_and_double_star_patterns() {
        let pattern = PathPattern::new("/content/**/*.html");
        assert!(pattern.matches("/content/page.html"));
        assert!(pattern.matches("/content/a/b/page.print.html"));
        assert!(!pattern.matches("/content/page.json"));
        assert!(!pattern.matches("/other/page.html"));

        let exact = PathPattern::new("/a");
        assert!(exact.matches("/a"));
        assert!(!exact.matches("/a/b"));

        assert!(PathPattern::new("/**").matches("/"));
    }

    #[test]
    fn accepts_honours_scope_method_extension_and_query() {
        let rule = RuleConfig::new("pages", "memory")
            .pattern("/content/**")
            .extensions(["html"])
            .query_params(["page"], false);

        assert!(rule.accepts(&CacheRequest::get("/content/a.html"), RequestScope::Request));
        assert!(rule.accepts(&CacheRequest::get("/content/a.html?page=2"), RequestScope::Request));
        assert!(!rule.accepts(&CacheRequest::get("/content/a.html?debug=1"), RequestScope::Request));
        assert!(!rule.accepts(&CacheRequest::get("/content/a.json"), RequestScope::Request));
        assert!(!rule.accepts(&CacheRequest::get("/content/a.html"), RequestScope::Include));

        let include = RuleConfig::new("fragments", "memory").scope(ScopeFilter::Include);
        assert!(include.accepts(&CacheRequest::get("/nav"), RequestScope::Include));
        assert!(!include.accepts(&CacheRequest::get("/nav"), RequestScope::Request));
    }

    #[test]
    fn empty_path_parts_do_not_collapse_keys() {
        let rule = RuleConfig::new("pages", "memory");
        let key = |path: &str| rule.build_key(&CacheRequest::get(path)).expect("key");

        assert_ne!(key("/a..html"), key("/a.html"));
        assert_ne!(key("/page."), key("/page"));
        assert_ne!(key("/a.b..html"), key("/a.b.html"));
    }

    #[test]
    fn equivalent_requests_share_a_key() {
        let rule = RuleConfig::new("pages", "memory")
            .query_params(["page", "sort"], true)
            .key_header(HeaderName::from_static("accept-language"));

        let a = CacheRequest::get("/list.html?sort=asc&page=2&utm=x")
            .with_header("accept-language", "de");
        let b = CacheRequest::get("/list.html?page=2&sort=asc").with_header("accept-language", "de");
        let c = CacheRequest::get("/list.html?page=3&sort=asc").with_header("accept-language", "de");

        let key_a = rule.build_key(&a).expect("key");
        assert_eq!(key_a, rule.build_key(&b).expect("key"));
        assert_ne!(key_a, rule.build_key(&c).expect("key"));
        assert_eq!(key_a.component("query:page"), Some(&["2".to_string()][..]));
        assert!(rule.knows_key(&key_a));
    }

    #[test]
    fn user_group_is_required_without_anonymous_fallback() {
        let header = HeaderName::from_static("x-user-group");
        let strict = RuleConfig::new("pages", "memory").user_group(header.clone(), None);
        assert_eq!(
            strict.build_key(&CacheRequest::get("/a")),
            Err(KeyError::MissingComponent("x-user-group".to_string()))
        );

        let lenient =
            RuleConfig::new("pages", "memory").user_group(header, Some("anonymous".to_string()));
        let anonymous = lenient.build_key(&CacheRequest::get("/a")).expect("key");
        let editors = lenient
            .build_key(&CacheRequest::get("/a").with_header("x-user-group", "editors"))
            .expect("key");
        assert_eq!(anonymous.component("group"), Some(&["anonymous".to_string()][..]));
        assert_ne!(anonymous, editors);
    }

    #[test]
    fn private_responses_are_vetoed() {
        let rule = RuleConfig::new("pages", "memory");
        let mut headers = HeaderMap::new();
        assert!(rule.accepts_response(StatusCode::OK, &headers));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0, Private"));
        assert!(!rule.accepts_response(StatusCode::OK, &headers));
    }

    #[test]
    fn keys_from_other_configs_are_unknown() {
        let rule = RuleConfig::new("pages", "memory");
        let foreign = CacheKey::builder("assets", "/a").build().expect("key");
        assert!(!rule.knows_key(&foreign));
    }
}
