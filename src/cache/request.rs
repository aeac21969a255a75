//! Request view consumed by cache configs.

use axum::http::{HeaderMap, Method, Uri, request::Parts};
use serde::Deserialize;

/// Whether a request is rendered as a full response or as an include
/// fragment of another response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestScope {
    #[default]
    Request,
    Include,
}

/// Request attributes a cache config may match on or fold into a key.
///
/// The last path segment is decomposed into resource name, selectors and
/// extension: `/content/page.print.a4.html` addresses `/content/page` with
/// selectors `print`, `a4` and extension `html`.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    method: Method,
    path: String,
    resource_path: String,
    selectors: Vec<String>,
    extension: Option<String>,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    scope: RequestScope,
}

impl CacheRequest {
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap) -> Self {
        let path = uri.path().to_string();
        let (resource_path, selectors, extension) = decompose_path(&path);
        let query = uri
            .query()
            .map(|raw| {
                url::form_urlencoded::parse(raw.as_bytes())
                    .map(|(name, value)| (name.into_owned(), value.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            method,
            path,
            resource_path,
            selectors,
            extension,
            query,
            headers,
            scope: RequestScope::Request,
        }
    }

    pub fn from_parts(parts: &Parts) -> Self {
        let mut request = Self::new(parts.method.clone(), &parts.uri, parts.headers.clone());
        if let Some(scope) = parts.extensions.get::<RequestScope>() {
            request.scope = *scope;
        }
        request
    }

    /// Shorthand for a header-less GET, mostly useful in tests and tooling.
    pub fn get(path_and_query: &str) -> Self {
        let uri = path_and_query
            .parse::<Uri>()
            .unwrap_or_else(|_| Uri::from_static("/"));
        Self::new(Method::GET, &uri, HeaderMap::new())
    }

    pub fn with_scope(mut self, scope: RequestScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.append(name, value);
        }
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path exactly as requested, before decomposition.
    pub fn path(&self) -> &str {
        &self.path
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

    pub fn query_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.query
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Distinct query parameter names, in first-seen order.
    pub fn query_names(&self) -> impl Iterator<Item = &str> {
        let mut seen: Vec<&str> = Vec::new();
        self.query.iter().filter_map(move |(name, _)| {
            if seen.contains(&name.as_str()) {
                return None;
            }
            seen.push(name.as_str());
            Some(name.as_str())
        })
    }

    pub fn has_query(&self) -> bool {
        !self.query.is_empty()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
    }

    pub fn scope(&self) -> RequestScope {
        self.scope
    }
}

/// Split the last path segment into name, selectors and extension.
///
/// A segment with an empty selector or extension (`a..html`, `page.`) is not
/// decomposed and stays whole in the resource path.
fn decompose_path(path: &str) -> (String, Vec<String>, Option<String>) {
    let split = path.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    let (parent, last) = path.split_at(split);

    if last.starts_with('.') || !last.contains('.') {
        return (path.to_string(), Vec::new(), None);
    }

    let mut parts: Vec<&str> = last.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return (path.to_string(), Vec::new(), None);
    }
    let name = parts.remove(0);
    let extension = parts.pop().map(str::to_string);
    let selectors = parts.into_iter().map(str::to_string).collect();

    (format!("{parent}{name}"), selectors, extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decomposes_selectors_and_extension() {
        let request = CacheRequest::get("/content/page.print.a4.html?lang=en");
        assert_eq!(request.resource_path(), "/content/page");
        assert_eq!(request.selectors(), ["print", "a4"]);
        assert_eq!(request.extension(), Some("html"));
        assert_eq!(request.query_values("lang").collect::<Vec<_>>(), ["en"]);
    }

    #[test]
    fn plain_paths_have_no_selectors() {
        let request = CacheRequest::get("/a");
        assert_eq!(request.resource_path(), "/a");
        assert!(request.selectors().is_empty());
        assert_eq!(request.extension(), None);
        assert!(!request.has_query());

        let dotted_dir = CacheRequest::get("/v1.2/readme");
        assert_eq!(dotted_dir.resource_path(), "/v1.2/readme");

        let hidden = CacheRequest::get("/.well-known");
        assert_eq!(hidden.resource_path(), "/.well-known");
    }

    #[test]
    fn empty_selectors_and_extensions_keep_the_segment_whole() {
        let doubled = CacheRequest::get("/a..html");
        assert_eq!(doubled.resource_path(), "/a..html");
        assert!(doubled.selectors().is_empty());
        assert_eq!(doubled.extension(), None);

        let trailing = CacheRequest::get("/page.");
        assert_eq!(trailing.resource_path(), "/page.");
        assert_eq!(trailing.extension(), None);

        let plain = CacheRequest::get("/a.html");
        assert_eq!(plain.resource_path(), "/a");
        assert_eq!(plain.extension(), Some("html"));
        assert_ne!(CacheRequest::get("/page").resource_path(), trailing.resource_path());
    }

    #[test]
    fn query_values_are_decoded_in_order() {
        let request = CacheRequest::get("/search?q=a%20b&q=c&page=2");
        assert_eq!(request.query_values("q").collect::<Vec<_>>(), ["a b", "c"]);
        assert_eq!(request.query_values("page").collect::<Vec<_>>(), ["2"]);
    }

    #[test]
    fn scope_comes_from_request_extensions() {
        let (mut parts, _) = axum::http::Request::builder()
            .uri("/fragment.html")
            .body(())
            .expect("request")
            .into_parts();
        parts.extensions.insert(RequestScope::Include);

        let request = CacheRequest::from_parts(&parts);
        assert_eq!(request.scope(), RequestScope::Include);
    }
}
