//! Worker protocol endpoints.
//!
//! Paths carry the build key and the worker's self-reported name; the
//! worker's address comes from the connection.

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use conveyor_core::ResourceId;
use conveyor_core::protocol::{
    ClaimRequest, ClaimResponse, JobFinishedReport, ReadyJobs, Reply, StepReport,
};
use conveyor_scheduler::Caller;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;
use crate::extract::ClientAddr;

/// Step output arrives in chunks; anything larger is a misbehaving worker.
const MAX_REPORT_BYTES: usize = 16 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ready_jobs/{build_key}/{client_name}", get(ready_jobs))
        .route(
            "/claim_job/{build_key}/{config}/{client_name}",
            post(claim_job),
        )
        .route(
            "/start_step_result/{build_key}/{client_name}/{stepresult_id}",
            post(start_step_result),
        )
        .route(
            "/update_step_result/{build_key}/{client_name}/{stepresult_id}",
            post(update_step_result),
        )
        .route(
            "/complete_step_result/{build_key}/{client_name}/{stepresult_id}",
            post(complete_step_result),
        )
        .route(
            "/job_finished/{build_key}/{client_name}/{job_id}",
            post(job_finished),
        )
        .route("/ping/{client_name}", post(ping))
        .layer(DefaultBodyLimit::max(MAX_REPORT_BYTES))
}

#[derive(Debug, Deserialize)]
struct ReadyQuery {
    #[serde(default)]
    configs: String,
}

async fn ready_jobs(
    State(state): State<AppState>,
    Path((build_key, client_name)): Path<(String, String)>,
    Query(query): Query<ReadyQuery>,
    ClientAddr(address): ClientAddr,
) -> Result<Json<ReadyJobs>, ApiError> {
    let configs: Vec<String> = query
        .configs
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    let caller = Caller::new(client_name, address);
    let jobs = state
        .dispatch
        .list_ready(&build_key, &caller, &configs)
        .await?;
    Ok(Json(jobs))
}

async fn claim_job(
    State(state): State<AppState>,
    Path((build_key, config, client_name)): Path<(String, String, String)>,
    ClientAddr(address): ClientAddr,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let caller = Caller::new(client_name, address);
    let response = state
        .dispatch
        .claim(&build_key, &config, &caller, req.job_id)
        .await?;
    Ok(Json(response))
}

async fn start_step_result(
    State(state): State<AppState>,
    Path((build_key, client_name, stepresult_id)): Path<(String, String, ResourceId)>,
    ClientAddr(address): ClientAddr,
    Json(report): Json<StepReport>,
) -> Result<Json<Reply>, ApiError> {
    let caller = Caller::new(client_name, address);
    let reply = state
        .dispatch
        .step_start(&build_key, &caller, stepresult_id, &report)
        .await?;
    Ok(Json(reply))
}

async fn update_step_result(
    State(state): State<AppState>,
    Path((build_key, client_name, stepresult_id)): Path<(String, String, ResourceId)>,
    ClientAddr(address): ClientAddr,
    Json(report): Json<StepReport>,
) -> Result<Json<Reply>, ApiError> {
    let caller = Caller::new(client_name, address);
    let reply = state
        .dispatch
        .step_update(&build_key, &caller, stepresult_id, &report)
        .await?;
    Ok(Json(reply))
}

async fn complete_step_result(
    State(state): State<AppState>,
    Path((build_key, client_name, stepresult_id)): Path<(String, String, ResourceId)>,
    ClientAddr(address): ClientAddr,
    Json(report): Json<StepReport>,
) -> Result<Json<Reply>, ApiError> {
    let caller = Caller::new(client_name, address);
    let reply = state
        .dispatch
        .step_complete(&build_key, &caller, stepresult_id, &report)
        .await?;
    Ok(Json(reply))
}

async fn job_finished(
    State(state): State<AppState>,
    Path((build_key, client_name, job_id)): Path<(String, String, ResourceId)>,
    ClientAddr(address): ClientAddr,
    Json(report): Json<JobFinishedReport>,
) -> Result<Json<Reply>, ApiError> {
    let caller = Caller::new(client_name, address);
    let reply = state
        .dispatch
        .job_finished(&build_key, &caller, job_id, &report)
        .await?;
    Ok(Json(reply))
}

async fn ping(
    State(state): State<AppState>,
    Path(client_name): Path<String>,
    ClientAddr(address): ClientAddr,
) -> Result<Json<Reply>, ApiError> {
    let reply = state.dispatch.ping(&Caller::new(client_name, address)).await?;
    Ok(Json(reply))
}
