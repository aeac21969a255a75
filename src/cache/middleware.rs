//! Response cache middleware.
//!
//! Serves hits straight from the matched config's store. On a miss the
//! downstream body is wrapped in a [`CaptureBody`], which copies every data
//! frame into a capture sink while it streams to the client and persists the
//! capture once the stream ends.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body::{Frame, SizeHint};
use tracing::{debug, instrument};

use super::capture::{AbandonReason, Capture, CapturedResponse};
use super::config::CacheConfig;
use super::content::CacheContent;
use super::engine::{CacheEngine, CachePhase, check_cacheable};
use super::request::CacheRequest;

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub engine: Arc<CacheEngine>,
    pub enabled: bool,
}

impl CacheState {
    pub fn new(engine: Arc<CacheEngine>) -> Self {
        Self {
            engine,
            enabled: true,
        }
    }
}

/// Middleware for response caching.
///
/// The final [`CachePhase`] known when the response leaves the middleware is
/// attached as a response extension. Captures report `Capturing`; whether
/// they end as `Cached` is decided at end of stream.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !cache.enabled {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let cache_request = CacheRequest::from_parts(&parts);
    let request = Request::from_parts(parts, body);

    let Some(config) = cache
        .engine
        .get_cache_config(&cache_request, cache_request.scope())
    else {
        return tagged(next.run(request).await, CachePhase::NotMatched);
    };

    if let Some(content) = cache.engine.lookup(&cache_request, config.as_ref()).await {
        if let Some(response) = replay(&content).await {
            debug!(cache = config.store_name(), outcome = "hit", "serving cached response");
            return tagged(response, CachePhase::Delivered);
        }
    }

    debug!(cache = config.store_name(), outcome = "miss", "cache miss, executing handler");
    let response = next.run(request).await;
    let (parts, body) = response.into_parts();

    let size = http_body::Body::size_hint(&body).exact();
    if let Err(reason) = check_cacheable(config.as_ref(), parts.status, &parts.headers, size) {
        debug!(cache = config.store_name(), reason = %reason, "response not cacheable");
        return tagged(Response::from_parts(parts, body), CachePhase::Miss);
    }

    let Some(capture) = cache.engine.begin_capture(&cache_request, config.as_ref()) else {
        return tagged(Response::from_parts(parts, body), CachePhase::Miss);
    };

    let pending = PendingPersist {
        engine: Arc::clone(&cache.engine),
        request: cache_request,
        config,
        status: parts.status,
        headers: parts.headers.clone(),
    };

    if http_body::Body::is_end_stream(&body) {
        // Nothing will be polled, so persist the empty body here.
        let cached = match pending.persist(capture) {
            Some(persist) => persist.await,
            None => false,
        };
        let phase = if cached { CachePhase::Cached } else { CachePhase::CaptureAbandoned };
        return tagged(Response::from_parts(parts, body), phase);
    }

    let body = Body::new(CaptureBody::new(body, capture, pending));
    tagged(Response::from_parts(parts, body), CachePhase::Capturing)
}

fn tagged(mut response: Response, phase: CachePhase) -> Response {
    response.extensions_mut().insert(phase);
    response
}

/// Rebuild a live response from stored content. `None` when the payload
/// can no longer be read.
async fn replay(content: &CacheContent) -> Option<Response> {
    let body = match content.payload().load().await {
        Ok(body) => body,
        Err(error) => {
            debug!(error = %error, "cached payload unreadable, treating as miss");
            return None;
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = content.status();
    *response.headers_mut() = content.header_map();
    if let Some(content_type) = content.content_type()
        && let Ok(value) = HeaderValue::from_str(content_type)
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Some(response)
}

struct PendingPersist {
    engine: Arc<CacheEngine>,
    request: CacheRequest,
    config: Arc<dyn CacheConfig>,
    status: StatusCode,
    headers: HeaderMap,
}

impl PendingPersist {
    /// Finalize `capture` and return the future storing it.
    fn persist(self, mut capture: Capture) -> Option<BoxFuture<'static, bool>> {
        let payload = match capture.finish() {
            Ok(payload) => payload,
            Err(error) => {
                debug!(path = self.request.path(), error = %error, "capture not persisted");
                return None;
            }
        };
        let PendingPersist {
            engine,
            request,
            config,
            status,
            headers,
        } = self;
        let captured = CapturedResponse {
            status,
            headers,
            character_encoding: None,
            payload,
        };
        Some(Box::pin(async move {
            engine.cache_response(&request, captured, config.as_ref()).await
        }))
    }
}

enum CaptureState {
    Streaming {
        capture: Capture,
        pending: PendingPersist,
    },
    Persisting(BoxFuture<'static, bool>),
    Done,
}

/// Body that tees data frames into a capture.
///
/// End of stream is reported only after the capture has been handed to the
/// store. An error frame or a drop before the end abandons the capture.
pub struct CaptureBody {
    inner: Body,
    state: CaptureState,
}

impl CaptureBody {
    fn new(inner: Body, capture: Capture, pending: PendingPersist) -> Self {
        Self {
            inner,
            state: CaptureState::Streaming { capture, pending },
        }
    }

    fn begin_persist(&mut self) {
        let CaptureState::Streaming { capture, pending } = mem::replace(&mut self.state, CaptureState::Done)
        else {
            return;
        };
        if let Some(persist) = pending.persist(capture) {
            self.state = CaptureState::Persisting(persist);
        }
    }

    fn abandon(&mut self, error: &axum::Error) {
        if let CaptureState::Streaming { mut capture, .. } = mem::replace(&mut self.state, CaptureState::Done) {
            capture.abandon(AbandonReason::StreamError, error);
        }
    }
}

impl http_body::Body for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        match &mut this.state {
            CaptureState::Persisting(persist) => {
                let cached = ready!(persist.as_mut().poll(cx));
                debug!(cached, "capture persisted at end of stream");
                this.state = CaptureState::Done;
                return Poll::Ready(None);
            }
            CaptureState::Done => return Pin::new(&mut this.inner).poll_frame(cx),
            CaptureState::Streaming { .. } => {}
        }

        match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let (CaptureState::Streaming { capture, .. }, Some(data)) =
                    (&mut this.state, frame.data_ref())
                {
                    capture.record(data);
                }
                if this.inner.is_end_stream() {
                    this.begin_persist();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(error)) => {
                this.abandon(&error);
                Poll::Ready(Some(Err(error)))
            }
            None => {
                this.begin_persist();
                if let CaptureState::Persisting(persist) = &mut this.state {
                    let cached = ready!(persist.as_mut().poll(cx));
                    debug!(cached, "capture persisted at end of stream");
                    this.state = CaptureState::Done;
                }
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.state {
            CaptureState::Persisting(_) => false,
            _ => self.inner.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use axum::{Router, middleware, routing::get};
    use futures::stream;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::cache::config::RuleConfig;
    use crate::cache::memory::{MemoryStore, MemoryStoreSettings};
    use crate::cache::store::CacheStore;

    fn engine() -> (Arc<CacheEngine>, Arc<MemoryStore>) {
        let engine = Arc::new(CacheEngine::new());
        let store = Arc::new(MemoryStore::new(MemoryStoreSettings::new("memory", 16)));
        engine.register_store(store.clone());
        engine.register_config(Arc::new(RuleConfig::new("pages", "memory").pattern("/a")));
        (engine, store)
    }

    fn app(engine: Arc<CacheEngine>) -> Router {
        Router::new()
            .route("/a", get(|| async { "hello" }))
            .route(
                "/stream",
                get(|| async {
                    let chunks = stream::iter([
                        Ok::<_, Infallible>(Bytes::from("one ")),
                        Ok(Bytes::from("two")),
                    ]);
                    Body::from_stream(chunks)
                }),
            )
            .layer(middleware::from_fn_with_state(CacheState::new(engine), response_cache_layer))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn body_completion_persists_capture() {
        let (engine, store) = engine();
        let response = app(engine).oneshot(get_request("/a")).await.expect("response");
        assert_eq!(response.extensions().get::<CachePhase>(), Some(&CachePhase::Capturing));

        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, Bytes::from("hello"));
        assert_eq!(store.size().await, 1);
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let (engine, store) = engine();
        let app = app(engine);
        let first = app.clone().oneshot(get_request("/a")).await.expect("response");
        first.into_body().collect().await.expect("body");

        let second = app.oneshot(get_request("/a")).await.expect("response");
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.extensions().get::<CachePhase>(), Some(&CachePhase::Delivered));
        assert_eq!(
            second.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/plain; charset=utf-8"))
        );
        let body = second.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, Bytes::from("hello"));
        assert_eq!(store.stats().hits, 1);
    }

    #[tokio::test]
    async fn unmatched_paths_pass_through() {
        let (engine, store) = engine();
        let response = app(engine).oneshot(get_request("/stream")).await.expect("response");
        assert_eq!(response.extensions().get::<CachePhase>(), Some(&CachePhase::NotMatched));
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, Bytes::from("one two"));
        assert_eq!(store.size().await, 0);
    }

    #[tokio::test]
    async fn streamed_bodies_are_captured_whole() {
        let (engine, store) = engine();
        engine.register_config(Arc::new(RuleConfig::new("streams", "memory").pattern("/stream")));
        let app = app(engine);

        let response = app.clone().oneshot(get_request("/stream")).await.expect("response");
        response.into_body().collect().await.expect("body");
        assert_eq!(store.size().await, 1);

        let replayed = app.oneshot(get_request("/stream")).await.expect("response");
        let body = replayed.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, Bytes::from("one two"));
    }

    #[tokio::test]
    async fn dropped_body_abandons_capture() {
        let (engine, store) = engine();
        let response = app(engine).oneshot(get_request("/a")).await.expect("response");
        drop(response);
        assert_eq!(store.size().await, 0);
    }

    #[tokio::test]
    async fn disabled_state_bypasses_cache() {
        let (engine, store) = engine();
        let state = CacheState {
            engine,
            enabled: false,
        };
        let app = Router::new()
            .route("/a", get(|| async { "hello" }))
            .layer(middleware::from_fn_with_state(state, response_cache_layer));
        let response = app.oneshot(get_request("/a")).await.expect("response");
        assert!(response.extensions().get::<CachePhase>().is_none());
        response.into_body().collect().await.expect("body");
        assert_eq!(store.size().await, 0);
    }
}
