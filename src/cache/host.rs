//! Synchronous response model for hosts that write bodies through
//! `std::io::Write`.

use std::io::{self, Write};

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use bytes::Bytes;

/// A response under construction by the host.
pub trait HostResponse: Send {
    fn status(&self) -> StatusCode;

    fn set_status(&mut self, status: StatusCode);

    fn headers(&self) -> &HeaderMap;

    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Raw byte channel to the client.
    fn output(&mut self) -> &mut dyn Write;

    /// Charset declared by the `Content-Type` header, lowercased.
    fn character_encoding(&self) -> Option<String> {
        self.headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                value.split(';').skip(1).find_map(|param| {
                    let (name, value) = param.split_once('=')?;
                    name.trim()
                        .eq_ignore_ascii_case("charset")
                        .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
                })
            })
    }

    fn set_content_type(&mut self, content_type: &str) {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }
}

/// In-memory [`HostResponse`].
#[derive(Debug, Default)]
pub struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        Bytes::from(self.body)
    }

    pub fn into_response(self) -> axum::response::Response {
        let mut response = axum::response::Response::new(axum::body::Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl HostResponse for BufferedResponse {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn output(&mut self) -> &mut dyn Write {
        &mut self.body
    }
}

impl Write for BufferedResponse {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charset_comes_from_content_type() {
        let mut response = BufferedResponse::new();
        assert_eq!(response.character_encoding(), None);

        response.set_content_type("text/html; Charset=\"ISO-8859-1\"");
        assert_eq!(response.character_encoding().as_deref(), Some("iso-8859-1"));
    }

    #[test]
    fn buffered_response_collects_output() {
        let mut response = BufferedResponse::new();
        response.set_status(StatusCode::CREATED);
        response.output().write_all(b"hello").expect("write");

        assert_eq!(response.body(), b"hello");
        let response = response.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
}
