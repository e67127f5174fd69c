use super::common::success_response;
use crate::{errors::ServiceError, AppState};
use axum::{
    extract::{Path, Query, State},
    response::Response,
    routing::{get, post},
    Router,
};
use serde::Deserialize;

/// Operator endpoints for the dead-letter side of the retry queue.
pub fn retry_jobs_routes() -> Router<AppState> {
    Router::new()
        .route("/retry-jobs/dead", get(list_dead))
        .route("/retry-jobs/:dedupe_key/requeue", post(requeue))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_limit() -> u64 {
    50
}

async fn list_dead(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Response, ServiceError> {
    let jobs = state.services.retry_jobs.list_dead(params.limit.min(500)).await?;
    Ok(success_response(jobs))
}

async fn requeue(
    State(state): State<AppState>,
    Path(dedupe_key): Path<String>,
) -> Result<Response, ServiceError> {
    let job = state.services.retry_jobs.requeue_dead(&dedupe_key).await?;
    Ok(success_response(job))
}
