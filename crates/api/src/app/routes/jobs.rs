//! Single-job inspection and operator actions.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use taskmill_core::JobId;
use taskmill_infra::CacheKey;

use crate::app::{errors, services::AppServices};
use crate::middleware::HTTP_CACHE_NAMESPACE;

#[derive(Debug, Default, Deserialize)]
pub struct RequeueRequest {
    /// Additional runs granted to the dead job (at least one)
    pub extra_attempts: Option<u32>,
}

pub fn router() -> Router {
    Router::new()
        .route("/:id", get(get_job).delete(remove_job))
        .route("/:id/requeue", post(requeue))
}

fn parse_job_id(raw: &str) -> Result<JobId, Response> {
    raw.parse().map_err(|_| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid job id `{raw}`"))
    })
}

async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.engine.job(id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => {
            errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        Err(e) => errors::engine_error_to_response(e),
    }
}

async fn requeue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<RequeueRequest>>,
) -> Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let extra = body.and_then(|Json(req)| req.extra_attempts).unwrap_or(1);

    match services.engine.requeue_dead(id, extra).await {
        Ok(job) => {
            invalidate_reads(&services).await;
            Json(job).into_response()
        }
        Err(e) => errors::engine_error_to_response(e),
    }
}

async fn remove_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.engine.remove(id).await {
        Ok(true) => {
            invalidate_reads(&services).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => errors::json_error(
            StatusCode::CONFLICT,
            "not_pending",
            format!("job {id} already started and cannot be removed"),
        ),
        Err(e) => errors::engine_error_to_response(e),
    }
}

async fn invalidate_reads(services: &AppServices) {
    services
        .cache
        .invalidate(&CacheKey::namespace_pattern(HTTP_CACHE_NAMESPACE))
        .await;
}
