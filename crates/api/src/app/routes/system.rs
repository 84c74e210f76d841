use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use serde_json::json;

use taskmill_infra::KvStore;

use crate::app::services::AppServices;

/// Liveness plus store reachability. `503` while the store is down.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let store_ok = services.engine.store().kv.ping().await.is_ok();
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if store_ok { "ok" } else { "degraded" },
            "backend": services.backend,
            "shutting_down": services.engine.is_shutting_down(),
            "active_jobs": services.engine.active_jobs().len(),
            "rate_limiter_degraded": services.limiter.is_degraded(),
            "cache": services.cache.stats(),
        })),
    )
}
