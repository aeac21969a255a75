//! Directory-backed content origin served behind the response cache.

use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use mime_guess::Mime;
use tokio::fs;
use tracing::warn;

use crate::config::ContentSettings;

#[derive(Debug, Clone)]
pub struct ContentOrigin {
    root: PathBuf,
    index_file: String,
}

/// A file read from the origin.
#[derive(Debug)]
pub struct ContentFile {
    contents: Bytes,
    mime: Mime,
}

impl ContentOrigin {
    pub fn new(settings: &ContentSettings) -> Self {
        Self {
            root: settings.root.clone(),
            index_file: settings.index_file.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a request path to a file under the root. Traversal and
    /// hidden segments are rejected; directories resolve to the index file.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = Path::new(request_path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => {
                    if segment.to_string_lossy().starts_with('.') {
                        return None;
                    }
                    resolved.push(segment);
                }
                Component::CurDir => {}
                _ => return None,
            }
        }
        if request_path.is_empty() || request_path.ends_with('/') {
            resolved.push(&self.index_file);
        }
        Some(resolved)
    }

    /// Load the file addressed by `request_path`, `Ok(None)` when absent.
    pub async fn load(&self, request_path: &str) -> Result<Option<ContentFile>, StatusCode> {
        let Some(mut path) = self.resolve(request_path) else {
            return Err(StatusCode::BAD_REQUEST);
        };

        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => path.push(&self.index_file),
            Ok(_) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "content metadata unavailable");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }

        match fs::read(&path).await {
            Ok(contents) => Ok(Some(ContentFile {
                contents: Bytes::from(contents),
                mime: mime_guess::from_path(&path).first_or_octet_stream(),
            })),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "content file unreadable");
                Err(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl ContentFile {
    pub fn mime(&self) -> &Mime {
        &self.mime
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

impl IntoResponse for ContentFile {
    fn into_response(self) -> Response {
        let len = self.contents.len();
        let mut response = Response::new(Body::from(self.contents));
        *response.status_mut() = StatusCode::OK;

        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(self.mime.as_ref()) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
            headers.insert(header::CONTENT_LENGTH, value);
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(root: &Path) -> ContentOrigin {
        ContentOrigin::new(&ContentSettings {
            root: root.to_path_buf(),
            index_file: "index.html".to_string(),
        })
    }

    #[tokio::test]
    async fn files_and_directory_indexes_load() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir(dir.path().join("docs")).expect("mkdir");
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").expect("write");
        std::fs::write(dir.path().join("docs/index.html"), "docs").expect("write");
        std::fs::write(dir.path().join("docs/data.json"), "{}").expect("write");
        let origin = origin(dir.path());

        let home = origin.load("/").await.expect("ok").expect("file");
        assert_eq!(home.mime().essence_str(), "text/html");

        let docs = origin.load("/docs").await.expect("ok").expect("file");
        assert_eq!(docs.len(), 4);

        let data = origin.load("/docs/data.json").await.expect("ok").expect("file");
        assert_eq!(data.mime().essence_str(), "application/json");

        assert!(origin.load("/missing.html").await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn traversal_and_hidden_files_are_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let origin = origin(dir.path());
        assert_eq!(origin.load("/../etc/passwd").await.err(), Some(StatusCode::BAD_REQUEST));
        assert_eq!(origin.load("/.git/config").await.err(), Some(StatusCode::BAD_REQUEST));
    }
}
