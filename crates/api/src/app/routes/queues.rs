//! Queue-level inspection.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;

use crate::app::{errors, services::AppServices};

const DEFAULT_DEAD_LIMIT: usize = 50;
const MAX_DEAD_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct DeadQuery {
    pub limit: Option<usize>,
}

pub fn router() -> Router {
    Router::new()
        .route("/queues", get(list))
        .route("/queues/:queue/stats", get(stats))
        .route("/queues/:queue/dead", get(dead))
}

async fn list(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match services.engine.all_queues().await {
        Ok(queues) => Json(json!({ "queues": queues })).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
) -> Response {
    match services.engine.stats(&queue).await {
        Ok(stats) => Json(json!({ "queue": queue, "stats": stats })).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

async fn dead(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    Query(query): Query<DeadQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LIMIT).min(MAX_DEAD_LIMIT);
    match services.engine.dead_jobs(&queue, limit).await {
        Ok(jobs) => Json(json!({ "queue": queue, "jobs": jobs })).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
