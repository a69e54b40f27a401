//! Query-cache statistics endpoint.

use axum::response::IntoResponse;
use axum::Json;

use crate::services::cache;
use crate::utils::{ApiError, ApiResult};

/// Hit/miss/eviction statistics for the log and metric query caches.
/// GET /api/v1/cache/stats
#[utoipa::path(
    get,
    path = "/api/v1/cache/stats",
    tag = "admin",
    responses(
        (status = 200, description = "Cache statistics", body = crate::services::cache::QueryCacheStats),
    ),
)]
pub async fn get_cache_stats() -> ApiResult<impl IntoResponse> {
    let stats = cache::global()
        .lock()
        .map(|cache| cache.stats())
        .map_err(|_| ApiError::internal("query cache lock poisoned"))?;
    Ok(Json(stats))
}
