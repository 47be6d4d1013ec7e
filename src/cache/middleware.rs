//! Page cache middleware.
//!
//! Two layers:
//! - [`kickstart_layer`] goes outermost and answers straight from storage on a hit.
//! - [`page_cache_layer`] wraps the application, drives a [`RequestLifecycle`]
//!   and opens the request scope used by `compute_hash(None)`.

use std::sync::Arc;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, future, stream};
use http_body_util::BodyExt;
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::{
    CacheConfig, CacheError, PageCacheStore, context,
    keys::RequestContext,
    kickstart::{Kickstart, KickstartOutcome, MissReason, RawRequest},
    lifecycle::{CachePhase, CapturedResponse, EligibilityRules, RequestLifecycle},
};

const METRIC_PAGE_HIT: &str = "pagecache_page_hit_total";
const METRIC_PAGE_MISS: &str = "pagecache_page_miss_total";

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub store: Arc<PageCacheStore>,
    pub rules: Arc<EligibilityRules>,
}

impl CacheState {
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        Ok(Self {
            store: Arc::new(PageCacheStore::new(config)),
            rules: Arc::new(EligibilityRules::from_config(config)?),
        })
    }
}

/// Serve stored pages before anything else runs.
pub async fn kickstart_layer(
    State(kickstart): State<Arc<Kickstart>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let raw = RawRequest::from_uri(request.method(), request.uri());
    let outcome = off_worker("kickstart", move || kickstart.try_serve(&raw))
        .await
        .unwrap_or(KickstartOutcome::Miss(MissReason::Unreadable));

    match outcome {
        KickstartOutcome::Hit(page) => page.into_response(),
        KickstartOutcome::Miss(reason) => {
            debug!(cache = "kickstart", outcome = "miss", reason = reason.as_str(), "falling through");
            next.run(request).await
        }
    }
}

/// Cache eligible GET responses and replay them on later requests.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_context = RequestContext::from_request(&request);
    let mut lifecycle = RequestLifecycle::new(
        cache.store.clone(),
        cache.rules.clone(),
        request_context.clone(),
    );

    if lifecycle.start(request.headers()) == CachePhase::Armed {
        let lookup = off_worker("get", move || {
            let page = lifecycle.cached();
            (lifecycle, page)
        })
        .await;
        let Some((armed, page)) = lookup else {
            return context::scope(request_context, next.run(request)).await;
        };
        if let Some(page) = page {
            counter!(METRIC_PAGE_HIT).increment(1);
            debug!(cache = "page", outcome = "hit", "serving cached page");
            return page.into_response();
        }
        counter!(METRIC_PAGE_MISS).increment(1);
        debug!(cache = "page", outcome = "miss", "cache miss, executing handler");
        lifecycle = armed;
    }

    let response = context::scope(request_context, next.run(request)).await;

    if lifecycle.phase() != CachePhase::Armed {
        return response;
    }
    if let Some(reason) = lifecycle
        .rules()
        .response_veto(response.status(), response.headers())
    {
        debug!(cache = "page", outcome = "skip", reason, "response not stored");
        lifecycle.skip();
        return response;
    }

    // Bodies of unknown or oversized length go straight to the client.
    let limit = lifecycle.rules().max_body_bytes();
    match response.body().size_hint().upper() {
        Some(upper) if upper <= limit as u64 => {}
        upper => {
            debug!(cache = "page", outcome = "skip", reason = "unbounded_body", ?upper, "response not stored");
            lifecycle.skip();
            return response;
        }
    }

    let (parts, body) = response.into_parts();
    let bytes = match buffer_body(body, limit).await {
        Ok(bytes) => bytes,
        Err(passthrough) => {
            lifecycle.skip();
            return Response::from_parts(parts, passthrough);
        }
    };
    lifecycle.capture();

    let captured = CapturedResponse {
        status: parts.status,
        headers: parts.headers.clone(),
        body: bytes.clone(),
    };
    off_worker("store", move || lifecycle.end(&captured)).await;

    Response::from_parts(parts, Body::from(bytes))
}

/// Buffer `body` up to `limit` bytes.
///
/// Past the limit, or on a body error, returns a body replaying what was read
/// followed by whatever the original body still yields.
async fn buffer_body(mut body: Body, limit: usize) -> Result<Bytes, Body> {
    let mut buffered = BytesMut::new();
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                // Trailers are not cached.
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                buffered.extend_from_slice(&data);
                if buffered.len() > limit {
                    debug!(cache = "page", outcome = "skip", reason = "too_large", "response not stored");
                    let head = stream::once(future::ready(Ok(buffered.freeze())));
                    return Err(Body::from_stream(head.chain(body.into_data_stream())));
                }
            }
            Err(err) => {
                warn!(
                    target = "pagecache::middleware",
                    op = "collect_body",
                    result = "passthrough",
                    error = %err,
                    "Response body failed while buffering"
                );
                return Err(Body::from_stream(stream::iter([
                    Ok(buffered.freeze()),
                    Err(err),
                ])));
            }
        }
    }
    Ok(buffered.freeze())
}

/// Run blocking storage I/O on the blocking pool.
async fn off_worker<T, F>(op: &'static str, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                target = "pagecache::middleware",
                op,
                result = "error",
                error = %err,
                "Cache storage task failed"
            );
            None
        }
    }
}
