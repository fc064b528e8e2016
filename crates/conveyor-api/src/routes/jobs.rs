//! Job view and administration.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use conveyor_core::ResourceId;
use conveyor_core::job::{ChangeLogEntry, Job, StepResult};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_job))
        .route("/{id}/invalidate", post(invalidate_job))
        .route("/{id}/activate", post(activate_job))
        .route("/{id}/cancel", post(cancel_job))
}

#[derive(Debug, Serialize)]
struct JobView {
    job: Job,
    recipe_name: String,
    recipe_filename: String,
    steps: Vec<StepResult>,
    change_log: Vec<ChangeLogEntry>,
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<Json<JobView>, ApiError> {
    let job = state.store.get_job(id).await?;
    let recipe = state.store.get_recipe(job.recipe_id).await?;
    let steps = state.store.step_results_for_job(id).await?;
    let change_log = state.store.change_log(id).await?;
    Ok(Json(JobView {
        job,
        recipe_name: recipe.definition.display_name,
        recipe_filename: recipe.definition.filename,
        steps,
        change_log,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct InvalidateRequest {
    #[serde(default)]
    same_client: bool,
    #[serde(default)]
    message: Option<String>,
}

async fn invalidate_job(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    body: Option<Json<InvalidateRequest>>,
) -> Result<Json<Job>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let message = req.message.unwrap_or_else(|| "Invalidated via API".to_string());
    let job = state
        .lifecycle
        .invalidate_job(id, req.same_client, &message)
        .await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct ActivateRequest {
    user: String,
}

async fn activate_job(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Json(req): Json<ActivateRequest>,
) -> Result<Json<Job>, ApiError> {
    if req.user.trim().is_empty() {
        return Err(ApiError::BadRequest("user is required".to_string()));
    }
    let job = state.lifecycle.activate_job(id, &req.user).await?;
    Ok(Json(job))
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    message: Option<String>,
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<Job>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let message = req.message.unwrap_or_else(|| "Canceled via API".to_string());
    let job = state.lifecycle.cancel_job(id, &message).await?;
    Ok(Json(job))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use conveyor_core::recipe::TriggerPolicy;
    use serde_json::json;

    use super::*;
    use crate::routes::testing::{definition, push_event, send, state};

    async fn one_job(state: &AppState, trigger: TriggerPolicy) -> String {
        let mut def = definition("a.kdl");
        def.trigger = trigger;
        state.store.create_recipe(&def).await.unwrap();
        let (_, created) = send(state, "POST", "/api/v1/events", Some(push_event("abc"))).await;
        created["jobs"][0].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_cancel_then_invalidate() {
        let state = state();
        let job_id = one_job(&state, TriggerPolicy::FullAuto).await;

        let (status, job) = send(
            &state,
            "POST",
            &format!("/api/v1/jobs/{}/cancel", job_id),
            Some(json!({ "message": "Canceled by alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "CANCELED");

        let (status, job) = send(
            &state,
            "POST",
            &format!("/api/v1/jobs/{}/invalidate", job_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "NOT_STARTED");
        assert_eq!(job["invalidated"], true);

        let (_, view) = send(&state, "GET", &format!("/api/v1/jobs/{}", job_id), None).await;
        let log: Vec<&str> = view["change_log"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["message"].as_str().unwrap())
            .collect();
        assert_eq!(log, vec!["Canceled by alice", "Invalidated via API"]);
        assert_eq!(view["recipe_filename"], "a.kdl");
    }

    #[tokio::test]
    async fn test_activate_requires_user() {
        let state = state();
        let job_id = one_job(&state, TriggerPolicy::Manual).await;

        let (status, _) = send(
            &state,
            "POST",
            &format!("/api/v1/jobs/{}/activate", job_id),
            Some(json!({ "user": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, job) = send(
            &state,
            "POST",
            &format!("/api/v1/jobs/{}/activate", job_id),
            Some(json!({ "user": "bob" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["active"], true);
        assert_eq!(job["ready"], true);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let state = state();
        let (status, body) = send(
            &state,
            "GET",
            &format!("/api/v1/jobs/{}", ResourceId::new()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }
}
