//! Response capture.
//!
//! Every byte bound for the client is written to the client first and then
//! copied into a capture sink. A failing sink only abandons the capture; a
//! failing client channel abandons it too and surfaces the error to the
//! writer. Captures that are dropped before `finish` count as abandoned.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Write};

use axum::http::{HeaderMap, HeaderName, StatusCode};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use super::content::{CacheContent, Payload};
use super::host::HostResponse;
use super::sink::CaptureSink;
use super::stats::METRIC_CAPTURE_ABANDONED;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("response output already claimed as {active}, cannot switch to {requested}")]
    ModeConflict {
        active: OutputMode,
        requested: OutputMode,
    },
    #[error("capture abandoned: {0}")]
    Abandoned(AbandonReason),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Bytes,
    Text,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputMode::Bytes => "byte output",
            OutputMode::Text => "text output",
        })
    }
}

/// Why a capture stopped recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    SinkFailed,
    ClientFailed,
    StreamError,
    Dropped,
}

impl AbandonReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AbandonReason::SinkFailed => "sink_error",
            AbandonReason::ClientFailed => "client_error",
            AbandonReason::StreamError => "stream_error",
            AbandonReason::Dropped => "dropped",
        }
    }
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character encodings text output can be produced in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextEncoding {
    #[default]
    Utf8,
    Latin1,
    Ascii,
}

impl TextEncoding {
    /// Resolve a charset label. Unknown labels fall back to UTF-8.
    pub fn from_label(label: Option<&str>) -> Self {
        let Some(label) = label else {
            return TextEncoding::Utf8;
        };
        match label.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => TextEncoding::Utf8,
            "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" => TextEncoding::Latin1,
            "us-ascii" | "ascii" => TextEncoding::Ascii,
            other => {
                warn!(charset = other, "unsupported response charset, writing utf-8");
                TextEncoding::Utf8
            }
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Latin1 => "iso-8859-1",
            TextEncoding::Ascii => "us-ascii",
        }
    }

    /// Encode `text`. Characters outside the charset become `?`.
    pub fn encode(self, text: &str) -> Cow<'_, [u8]> {
        let limit = match self {
            TextEncoding::Utf8 => return Cow::Borrowed(text.as_bytes()),
            TextEncoding::Latin1 => 0xFF,
            TextEncoding::Ascii => 0x7F,
        };
        if text.is_ascii() {
            return Cow::Borrowed(text.as_bytes());
        }
        Cow::Owned(
            text.chars()
                .map(|ch| u8::try_from(u32::from(ch)).ok().filter(|byte| u32::from(*byte) <= limit).unwrap_or(b'?'))
                .collect(),
        )
    }
}

/// Output mode claimed by a response. Exactly one mode per response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseSink {
    #[default]
    Unclaimed,
    Bytes,
    Text(TextEncoding),
}

impl ResponseSink {
    fn mode(self) -> Option<OutputMode> {
        match self {
            ResponseSink::Unclaimed => None,
            ResponseSink::Bytes => Some(OutputMode::Bytes),
            ResponseSink::Text(_) => Some(OutputMode::Text),
        }
    }

    /// Claim `requested`, failing if the other mode is already in use.
    fn claim(&mut self, requested: OutputMode, encoding: impl FnOnce() -> TextEncoding) -> Result<(), CaptureError> {
        match (self.mode(), requested) {
            (None, OutputMode::Bytes) => *self = ResponseSink::Bytes,
            (None, OutputMode::Text) => *self = ResponseSink::Text(encoding()),
            (Some(active), requested) if active != requested => {
                return Err(CaptureError::ModeConflict { active, requested });
            }
            _ => {}
        }
        Ok(())
    }
}

/// Recording half of a capture, shared by every host model.
pub(crate) struct Capture {
    store: String,
    sink: Option<Box<dyn CaptureSink>>,
    abandoned: Option<AbandonReason>,
}

impl Capture {
    pub(crate) fn new(store: impl Into<String>, sink: Box<dyn CaptureSink>) -> Self {
        Self {
            store: store.into(),
            sink: Some(sink),
            abandoned: None,
        }
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.sink.is_some()
    }

    pub(crate) fn abandoned(&self) -> Option<AbandonReason> {
        self.abandoned
    }

    /// Copy bytes already delivered to the client.
    pub(crate) fn record(&mut self, buf: &[u8]) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(error) = sink.write(buf) {
            self.abandon(AbandonReason::SinkFailed, &error);
        }
    }

    pub(crate) fn flush(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(error) = sink.flush() {
            self.abandon(AbandonReason::SinkFailed, &error);
        }
    }

    pub(crate) fn abandon(&mut self, reason: AbandonReason, detail: &dyn fmt::Display) {
        if self.sink.take().is_none() {
            return;
        }
        self.abandoned = Some(reason);
        warn!(
            store = %self.store,
            reason = reason.as_str(),
            error = %detail,
            "response capture abandoned"
        );
        counter!(METRIC_CAPTURE_ABANDONED, "reason" => reason.as_str()).increment(1);
    }

    /// Finalize the sink into a payload.
    pub(crate) fn finish(&mut self) -> Result<Payload, CaptureError> {
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => {
                return Err(CaptureError::Abandoned(
                    self.abandoned.unwrap_or(AbandonReason::Dropped),
                ));
            }
        };
        match sink.finish() {
            Ok(payload) => Ok(payload),
            Err(error) => {
                self.abandoned = Some(AbandonReason::SinkFailed);
                warn!(store = %self.store, error = %error, "capture sink failed to finish");
                counter!(METRIC_CAPTURE_ABANDONED, "reason" => AbandonReason::SinkFailed.as_str())
                    .increment(1);
                Err(CaptureError::Abandoned(AbandonReason::SinkFailed))
            }
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if self.sink.is_some() {
            self.abandon(AbandonReason::Dropped, &"capture dropped before completion");
        }
    }
}

/// A finished capture, ready to be handed to a store.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    /// Live response headers at finish, including ones that are never persisted.
    pub headers: HeaderMap,
    pub character_encoding: Option<String>,
    pub payload: Payload,
}

impl CapturedResponse {
    pub fn body_len(&self) -> u64 {
        self.payload.len()
    }

    /// Persisted representation, minus the `excluded` headers.
    pub fn into_content(self, excluded: &[HeaderName]) -> CacheContent {
        CacheContent::from_response(self.status, &self.headers, excluded, self.payload)
            .with_character_encoding(self.character_encoding)
    }
}

/// Wraps a [`HostResponse`] so everything written to it is also captured.
pub struct CaptureResponse<'a, R: HostResponse + ?Sized> {
    response: &'a mut R,
    capture: Capture,
    sink: ResponseSink,
}

impl<'a, R: HostResponse + ?Sized> CaptureResponse<'a, R> {
    pub(crate) fn new(response: &'a mut R, capture: Capture) -> Self {
        Self {
            response,
            capture,
            sink: ResponseSink::Unclaimed,
        }
    }

    pub fn sink(&self) -> ResponseSink {
        self.sink
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_recording()
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.response.set_status(status);
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.response.headers_mut()
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.response.set_content_type(content_type);
    }

    /// Claim byte output.
    pub fn output_stream(&mut self) -> Result<ByteOutput<'_, 'a, R>, CaptureError> {
        self.sink.claim(OutputMode::Bytes, TextEncoding::default)?;
        Ok(ByteOutput { inner: self })
    }

    /// Claim text output, encoded in the response charset.
    pub fn writer(&mut self) -> Result<TextOutput<'_, 'a, R>, CaptureError> {
        let declared = self.response.character_encoding();
        self.sink
            .claim(OutputMode::Text, || TextEncoding::from_label(declared.as_deref()))?;
        Ok(TextOutput { inner: self })
    }

    fn tee(&mut self, buf: &[u8]) -> io::Result<()> {
        if let Err(error) = self.response.output().write_all(buf) {
            self.capture.abandon(AbandonReason::ClientFailed, &error);
            return Err(error);
        }
        self.capture.record(buf);
        Ok(())
    }

    fn flush_both(&mut self) -> io::Result<()> {
        if let Err(error) = self.response.output().flush() {
            self.capture.abandon(AbandonReason::ClientFailed, &error);
            return Err(error);
        }
        self.capture.flush();
        Ok(())
    }

    /// Flush and finalize. Status and headers are read at this point.
    pub fn finish(mut self) -> Result<CapturedResponse, CaptureError> {
        self.flush_both()?;
        let payload = self.capture.finish()?;
        let character_encoding = match self.sink {
            ResponseSink::Text(encoding) => Some(encoding.label().to_string()),
            _ => self.response.character_encoding(),
        };
        debug!(bytes = payload.len(), "response captured");
        Ok(CapturedResponse {
            status: self.response.status(),
            headers: self.response.headers().clone(),
            character_encoding,
            payload,
        })
    }
}

/// Byte half of [`CaptureResponse`].
pub struct ByteOutput<'w, 'a, R: HostResponse + ?Sized> {
    inner: &'w mut CaptureResponse<'a, R>,
}

impl<R: HostResponse + ?Sized> Write for ByteOutput<'_, '_, R> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.tee(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush_both()
    }
}

/// Text half of [`CaptureResponse`].
pub struct TextOutput<'w, 'a, R: HostResponse + ?Sized> {
    inner: &'w mut CaptureResponse<'a, R>,
}

impl<R: HostResponse + ?Sized> TextOutput<'_, '_, R> {
    pub fn encoding(&self) -> TextEncoding {
        match self.inner.sink {
            ResponseSink::Text(encoding) => encoding,
            _ => TextEncoding::default(),
        }
    }

    pub fn write_text(&mut self, text: &str) -> io::Result<()> {
        let encoded = self.encoding().encode(text);
        self.inner.tee(&encoded)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush_both()
    }
}

impl<R: HostResponse + ?Sized> fmt::Write for TextOutput<'_, '_, R> {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        self.write_text(text).map_err(|_| fmt::Error)
    }
}
