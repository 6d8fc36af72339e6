//! API route definitions.
//!
//! Responses use the `{ "data": ..., "meta": ... }` envelope. The acting
//! user comes from the `x-user-id` header.

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::scheduler::{JobFilter, JobSpec};

pub const USER_HEADER: &str = "x-user-id";

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;
const DEFAULT_PREVIEW_HOURS: u64 = 24;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tenants/{tenant}/jobs", get(list_jobs))
        .route("/tenants/{tenant}/jobs/{job}", get(get_job).put(put_job).delete(delete_job))
        .route("/tenants/{tenant}/jobs/{job}/enable", post(enable_job))
        .route("/tenants/{tenant}/jobs/{job}/disable", post(disable_job))
        .route("/tenants/{tenant}/jobs/{job}/run", post(run_job))
        .route("/tenants/{tenant}/jobs/{job}/history", get(job_history))
        .route("/tenants/{tenant}/jobs/{job}/preview", get(job_preview))
}

/// The authenticated caller, as asserted by the fronting proxy.
pub struct ActingUser(pub String);

impl<S> FromRequestParts<S> for ActingUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| ActingUser(v.to_string()))
            .ok_or_else(|| ApiError::Unauthenticated(format!("missing {} header", USER_HEADER)))
    }
}

fn parse_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid job id '{}'", raw)))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "scheduler": state.service.stats(),
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn list_jobs(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    ActingUser(user): ActingUser,
    Query(filter): Query<JobFilter>,
) -> ApiResult<Json<Value>> {
    let jobs = state.service.list_jobs(&tenant, &user, &filter).await?;
    Ok(Json(json!({ "data": jobs, "meta": { "total": jobs.len() } })))
}

/// `{job}` is a job id when it parses as one, otherwise a job key.
async fn get_job(
    State(state): State<AppState>,
    Path((tenant, job)): Path<(String, String)>,
    ActingUser(user): ActingUser,
) -> ApiResult<Json<Value>> {
    let found = match Uuid::parse_str(&job) {
        Ok(id) => state.service.get_job(&tenant, &user, id).await?,
        Err(_) => state
            .service
            .find_job(&tenant, &user, &job)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("job '{}' not found", job)))?,
    };
    Ok(Json(json!({ "data": found })))
}

/// Upsert keyed on `(tenant, key)`.
async fn put_job(
    State(state): State<AppState>,
    Path((tenant, key)): Path<(String, String)>,
    ActingUser(user): ActingUser,
    Json(spec): Json<JobSpec>,
) -> ApiResult<Json<Value>> {
    let job = state.service.create_or_update(&tenant, &key, &user, spec).await?;
    Ok(Json(json!({ "data": job })))
}

async fn delete_job(
    State(state): State<AppState>,
    Path((tenant, job)): Path<(String, String)>,
    ActingUser(user): ActingUser,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&job)?;
    state.service.delete_job(&tenant, &user, id).await?;
    Ok(Json(json!({ "data": { "deleted": id } })))
}

async fn enable_job(
    state: State<AppState>,
    path: Path<(String, String)>,
    user: ActingUser,
) -> ApiResult<Json<Value>> {
    set_enabled(state, path, user, true).await
}

async fn disable_job(
    state: State<AppState>,
    path: Path<(String, String)>,
    user: ActingUser,
) -> ApiResult<Json<Value>> {
    set_enabled(state, path, user, false).await
}

async fn set_enabled(
    State(state): State<AppState>,
    Path((tenant, job)): Path<(String, String)>,
    ActingUser(user): ActingUser,
    enabled: bool,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&job)?;
    let job = state.service.set_enabled(&tenant, &user, id, enabled).await?;
    Ok(Json(json!({ "data": job })))
}

/// Runs on its own task so a client disconnect does not lose the record.
async fn run_job(
    State(state): State<AppState>,
    Path((tenant, job)): Path<(String, String)>,
    ActingUser(user): ActingUser,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&job)?;
    let service = state.service.clone();
    let record = tokio::spawn(async move {
        service
            .run_now(&tenant, &user, id, tokio_util::sync::CancellationToken::new())
            .await
    })
    .await
    .map_err(crate::error::SchedulerError::from)??;
    Ok(Json(json!({ "data": record })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn job_history(
    State(state): State<AppState>,
    Path((tenant, job)): Path<(String, String)>,
    ActingUser(user): ActingUser,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&job)?;
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
    let records = state.service.history(&tenant, &user, id, limit).await?;
    Ok(Json(json!({ "data": records, "meta": { "total": records.len() } })))
}

#[derive(Debug, Deserialize)]
struct PreviewQuery {
    hours: Option<u64>,
}

async fn job_preview(
    State(state): State<AppState>,
    Path((tenant, job)): Path<(String, String)>,
    ActingUser(user): ActingUser,
    Query(q): Query<PreviewQuery>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&job)?;
    let hours = q.hours.unwrap_or(DEFAULT_PREVIEW_HOURS);
    let upcoming = state.service.preview(&tenant, &user, id, hours).await?;
    Ok(Json(json!({ "data": { "upcoming": upcoming }, "meta": { "hours": hours } })))
}
