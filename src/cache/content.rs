//! Captured response representation.

use std::io;
use std::path::Path;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;

/// Response body as held by a store.
///
/// Small captures stay inline; large ones remain in the spool file the
/// capture sink wrote and are read back on demand.
#[derive(Debug, Clone)]
pub enum Payload {
    Inline(Bytes),
    Spooled(SpooledPayload),
}

/// Handle to a spooled capture. The file is removed once the last handle drops.
#[derive(Debug, Clone)]
pub struct SpooledPayload {
    path: Arc<TempPath>,
    len: u64,
}

impl SpooledPayload {
    pub fn new(path: TempPath, len: u64) -> Self {
        Self {
            path: Arc::new(path),
            len,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Payload {
    pub fn len(&self) -> u64 {
        match self {
            Payload::Inline(bytes) => bytes.len() as u64,
            Payload::Spooled(spooled) => spooled.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the full body into memory.
    pub async fn load(&self) -> io::Result<Bytes> {
        match self {
            Payload::Inline(bytes) => Ok(bytes.clone()),
            Payload::Spooled(spooled) => {
                let data = tokio::fs::read(spooled.path()).await?;
                if data.len() as u64 != spooled.len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "spooled payload truncated: expected {} bytes, found {}",
                            spooled.len,
                            data.len()
                        ),
                    ));
                }
                Ok(Bytes::from(data))
            }
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Inline(bytes)
    }
}

/// Raw header value bytes.
///
/// Persisted as a JSON string when the bytes are UTF-8, otherwise as
/// `{"hex": ".."}`, so opaque values such as Latin-1 filenames survive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredValue", into = "StoredValue")]
pub struct StoredHeaderValue(Bytes);

impl StoredHeaderValue {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Printable form for operators. Invalid UTF-8 is replaced.
    pub fn to_display(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<&HeaderValue> for StoredHeaderValue {
    fn from(value: &HeaderValue) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<&str> for StoredHeaderValue {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl PartialEq<&str> for StoredHeaderValue {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StoredValue {
    Text(String),
    Raw { hex: String },
}

impl From<StoredValue> for StoredHeaderValue {
    fn from(value: StoredValue) -> Self {
        match value {
            StoredValue::Text(text) => Self(Bytes::from(text)),
            // Undecodable hex degrades to the literal text.
            StoredValue::Raw { hex } => match hex::decode(&hex) {
                Ok(raw) => Self(Bytes::from(raw)),
                Err(_) => Self(Bytes::from(hex)),
            },
        }
    }
}

impl From<StoredHeaderValue> for StoredValue {
    fn from(value: StoredHeaderValue) -> Self {
        match std::str::from_utf8(&value.0) {
            Ok(text) => StoredValue::Text(text.to_string()),
            Err(_) => StoredValue::Raw {
                hex: hex::encode(&value.0),
            },
        }
    }
}

/// Everything about a response except its body, in persisted form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMeta {
    pub status: u16,
    pub character_encoding: Option<String>,
    pub content_type: Option<String>,
    /// Header name to values, in first-seen order.
    pub headers: Vec<(String, Vec<StoredHeaderValue>)>,
}

/// Immutable captured response handed to and returned from stores.
#[derive(Debug, Clone)]
pub struct CacheContent {
    meta: ContentMeta,
    payload: Payload,
}

impl CacheContent {
    pub fn new(meta: ContentMeta, payload: impl Into<Payload>) -> Self {
        Self {
            meta,
            payload: payload.into(),
        }
    }

    /// Build from a live header map, dropping the `excluded` header names.
    pub fn from_response(
        status: StatusCode,
        headers: &HeaderMap,
        excluded: &[HeaderName],
        payload: impl Into<Payload>,
    ) -> Self {
        let content_type = headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let character_encoding = content_type.as_deref().and_then(charset_of);

        let mut grouped: Vec<(String, Vec<StoredHeaderValue>)> = Vec::new();
        for (name, value) in headers {
            if excluded.contains(name) {
                continue;
            }
            let value = StoredHeaderValue::from(value);
            match grouped.iter_mut().find(|(existing, _)| existing == name.as_str()) {
                Some((_, values)) => values.push(value),
                None => grouped.push((name.as_str().to_string(), vec![value])),
            }
        }

        Self::new(
            ContentMeta {
                status: status.as_u16(),
                character_encoding,
                content_type,
                headers: grouped,
            },
            payload,
        )
    }

    pub fn meta(&self) -> &ContentMeta {
        &self.meta
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.meta.status).unwrap_or(StatusCode::OK)
    }

    pub fn character_encoding(&self) -> Option<&str> {
        self.meta.character_encoding.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.meta.content_type.as_deref()
    }

    pub fn headers(&self) -> &[(String, Vec<StoredHeaderValue>)] {
        &self.meta.headers
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Approximate in-memory footprint used for byte budgets.
    pub fn approximate_size(&self) -> u64 {
        let headers: usize = self
            .meta
            .headers
            .iter()
            .map(|(name, values)| {
                name.len() + values.iter().map(|value| value.as_bytes().len()).sum::<usize>()
            })
            .sum();
        self.payload.len() + headers as u64
    }

    /// Rebuild a header map from the stored pairs.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, values) in &self.meta.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                    map.append(name.clone(), value);
                }
            }
        }
        map
    }

    /// Record the encoding text output was produced in, when known.
    pub fn with_character_encoding(mut self, encoding: Option<String>) -> Self {
        if encoding.is_some() {
            self.meta.character_encoding = encoding;
        }
        self
    }

    /// Replace the payload with an inline copy, keeping metadata.
    pub fn with_inline_payload(&self, bytes: Bytes) -> Self {
        Self {
            meta: self.meta.clone(),
            payload: Payload::Inline(bytes),
        }
    }
}

fn charset_of(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use axum::http::header;

    use super::*;

    #[test]
    fn from_response_groups_headers_and_drops_excluded() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=UTF-8"));
        headers.append(header::VARY, HeaderValue::from_static("accept"));
        headers.append(header::VARY, HeaderValue::from_static("accept-language"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let excluded = [HeaderName::from_static("x-request-id")];
        let content =
            CacheContent::from_response(StatusCode::OK, &headers, &excluded, Bytes::from("hi"));

        assert_eq!(content.character_encoding(), Some("utf-8"));
        assert_eq!(content.content_type(), Some("text/html; charset=UTF-8"));
        assert!(content.headers().iter().all(|(name, _)| name != "x-request-id"));

        let vary = content
            .headers()
            .iter()
            .find(|(name, _)| name == "vary")
            .expect("vary header");
        assert_eq!(vary.1, ["accept", "accept-language"]);

        let rebuilt = content.header_map();
        assert_eq!(rebuilt.get_all(header::VARY).iter().count(), 2);
    }

    #[test]
    fn non_ascii_header_values_survive_persistence() {
        let disposition = "attachment; filename=\"caf\u{e9}.txt\"";
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_bytes(disposition.as_bytes()).expect("utf-8 bytes"),
        );
        headers.insert("x-latin1", HeaderValue::from_bytes(b"caf\xe9").expect("opaque bytes"));

        let content = CacheContent::from_response(StatusCode::OK, &headers, &[], Bytes::new());
        assert_eq!(content.headers().len(), 2);

        let json = serde_json::to_vec(content.meta()).expect("serialize");
        let restored: ContentMeta = serde_json::from_slice(&json).expect("deserialize");
        assert_eq!(&restored, content.meta());

        let rebuilt = CacheContent::new(restored, Bytes::new()).header_map();
        assert_eq!(
            rebuilt.get(header::CONTENT_DISPOSITION).map(HeaderValue::as_bytes),
            Some(disposition.as_bytes())
        );
        assert_eq!(
            rebuilt.get("x-latin1").map(HeaderValue::as_bytes),
            Some(&b"caf\xe9"[..])
        );
    }

    #[tokio::test]
    async fn spooled_payload_loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"spooled body").expect("write");
        let path = file.into_temp_path();

        let payload = Payload::Spooled(SpooledPayload::new(path, 12));
        assert_eq!(payload.len(), 12);
        assert_eq!(payload.load().await.expect("load"), Bytes::from("spooled body"));
    }

    #[tokio::test]
    async fn missing_spool_file_is_an_error() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        let path = file.into_temp_path();
        let location = path.to_path_buf();
        let payload = Payload::Spooled(SpooledPayload::new(path, 4));
        std::fs::remove_file(&location).expect("remove");

        assert!(payload.load().await.is_err());
    }
}
