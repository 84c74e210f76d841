//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store selection and component wiring
//! - `routes/`: operator endpoints (one file per area)
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, build_services};

/// Freshness bound for cached operator reads.
pub const OPERATOR_CACHE_TTL_SECS: u64 = 2;

/// Build the operator router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    let rate_limit = middleware::RateLimitState::new(
        services.limiter.clone(),
        &services.config.rate_limit.limit,
        "http",
    );
    let cache =
        middleware::CacheState::new(services.cache.clone(), "operator", OPERATOR_CACHE_TTL_SECS);

    // Cached reads: queue-level views only; job detail is always live.
    let cached = routes::queues::router().route_layer(axum::middleware::from_fn_with_state(
        cache,
        middleware::cache_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(cached)
        .nest("/jobs", routes::jobs::router())
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn_with_state(
                    rate_limit,
                    middleware::rate_limit_middleware,
                ))
                .layer(Extension(services)),
        )
}
