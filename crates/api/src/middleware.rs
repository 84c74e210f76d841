use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use taskmill_infra::{Cache, CacheKey, RateLimit, RateLimitDecision, RateLimiter};

/// Namespace of every cache entry written by [`cache_middleware`].
pub const HTTP_CACHE_NAMESPACE: &str = "http";

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Derives the throttling key of a request.
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub max: u64,
    pub window: Duration,
    /// Separates counters of differently configured layers
    pub scope: String,
    pub key_fn: KeyFn,
}

impl RateLimitState {
    pub fn new(limiter: Arc<RateLimiter>, limit: &RateLimit, scope: impl Into<String>) -> Self {
        Self {
            limiter,
            max: limit.max,
            window: limit.window,
            scope: scope.into(),
            key_fn: Arc::new(client_key),
        }
    }

    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }
}

/// Client address as reported by the proxy chain.
pub fn client_key(req: &Request) -> String {
    let headers = req.headers();
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, "x-real-ip").map(str::trim).filter(|v| !v.is_empty()))
        .unwrap_or("anonymous")
        .to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    req: Request,
    next: Next,
) -> Response {
    let key = format!("{}:{}", state.scope, (state.key_fn)(&req));
    let decision = state.limiter.allow(&key, state.max, state.window).await;

    let mut response = if decision.allowed {
        next.run(req).await
    } else {
        too_many_requests(&decision)
    };

    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at.timestamp()));
    response
}

fn too_many_requests(decision: &RateLimitDecision) -> Response {
    let retry_after_secs = retry_after_secs(decision.retry_after);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        axum::Json(json!({
            "error": "too_many_requests",
            "message": format!("rate limit of {} requests exceeded", decision.limit),
            "retry_after_secs": retry_after_secs,
        })),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

/// Whole seconds, rounded up, never below one.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

#[derive(Debug, Clone)]
pub struct CacheState {
    pub cache: Cache,
    /// Logical operation the wrapped routes serve
    pub operation: String,
    pub ttl_seconds: u64,
}

impl CacheState {
    pub fn new(cache: Cache, operation: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            cache,
            operation: operation.into(),
            ttl_seconds,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse {
    content_type: Option<String>,
    body: String,
}

pub async fn cache_middleware(
    State(state): State<CacheState>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() != Method::GET {
        return next.run(req).await;
    }

    let key = request_cache_key(&state.operation, req.uri());
    if let Some(cached) = state.cache.get::<CachedResponse>(&key).await {
        return cached_response(cached);
    }

    let response = next.run(req).await;
    if response.status() != StatusCode::OK {
        return with_cache_header(response, "MISS");
    }

    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(
                error = %e,
                operation = %state.operation,
                "failed to buffer response for caching"
            );
            return crate::app::errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "failed to read response body",
            );
        }
    };

    if let Ok(text) = std::str::from_utf8(&bytes) {
        let entry = CachedResponse {
            content_type: parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: text.to_string(),
        };
        state
            .cache
            .set(&key, &entry, Duration::from_secs(state.ttl_seconds))
            .await;
    }

    with_cache_header(Response::from_parts(parts, Body::from(bytes)), "MISS")
}

/// `http:{operation}:{digest of path and sorted query}`
pub fn request_cache_key(operation: &str, uri: &Uri) -> String {
    let mut query: Vec<(&str, &str)> = uri
        .query()
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect();
    query.sort_unstable();

    CacheKey::new(HTTP_CACHE_NAMESPACE, operation)
        .with_params(&json!({ "path": uri.path(), "query": query }))
        .to_string()
}

fn cached_response(cached: CachedResponse) -> Response {
    let mut response = Response::new(Body::from(cached.body));
    if let Some(value) = cached.content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    with_cache_header(response, "HIT")
}

fn with_cache_header(mut response: Response, value: &'static str) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(value));
    response
}
