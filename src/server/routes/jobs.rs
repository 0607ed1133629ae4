//! CRUD + cancel surface for jobs. Validation and persistence live in the
//! kernel's Intake Adaptor; these handlers only translate HTTP <-> that
//! contract.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kernel::jobs::store::clamp_list_args;
use crate::kernel::{CreateJobRequest, Job};
use crate::server::app::AppState;
use crate::server::error::ApiError;

pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state.intake.create_job(req).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Job>, ApiError> {
    let job = state.intake.get_job(id).await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Serialize)]
pub struct ListResponse {
    pub jobs: Vec<Job>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let (limit, offset) = clamp_list_args(query.limit.unwrap_or(20), query.offset.unwrap_or(0));
    let (jobs, total) = state.intake.list_jobs(limit, offset).await?;
    Ok(Json(ListResponse {
        jobs,
        total,
        limit,
        offset,
    }))
}

pub async fn delete_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.intake.delete_job(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Job>, ApiError> {
    let job = state.intake.cancel_job(id).await?;
    Ok(Json(job))
}
