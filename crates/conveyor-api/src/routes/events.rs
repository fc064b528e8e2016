//! Event ingestion and event administration.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use conveyor_core::ResourceId;
use conveyor_core::event::{BranchStatus, Event, NewEvent, PullRequestStatus};
use conveyor_core::graph::JobNode;
use conveyor_scheduler::EventSnapshot;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub const SIGNATURE_HEADER: &str = "X-Conveyor-Signature";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_event))
        .route("/{id}", get(get_event))
        .route("/{id}/cancel", post(cancel_event))
}

#[derive(Debug, Serialize)]
struct CreateEventResponse {
    event_id: Option<ResourceId>,
    created: bool,
    jobs: Vec<ResourceId>,
}

async fn create_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateEventResponse>), ApiError> {
    if let Some(secret) = &state.config.event_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            warn!("Invalid event signature");
            return Err(ApiError::Unauthorized("Invalid signature".to_string()));
        }
    }

    let new: NewEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;
    info!(
        repository = %new.base.repository,
        cause = %new.cause,
        head = %new.head.sha,
        "Received event"
    );

    let outcome = state.lifecycle.create_event(&new).await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(CreateEventResponse {
            event_id: outcome.event.map(|e| e.id),
            created: outcome.created,
            jobs: outcome.jobs.into_iter().map(|j| j.id).collect(),
        }),
    ))
}

/// Check a `sha256=<hex>` HMAC over the raw body.
fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}

#[derive(Debug, Serialize)]
struct EventView {
    event: Event,
    /// Jobs grouped so that every job comes after the jobs it depends on.
    sorted_jobs: Vec<Vec<JobNode>>,
    pull_request: Option<PullRequestStatus>,
    branch: Option<BranchStatus>,
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<Json<EventView>, ApiError> {
    let snapshot = EventSnapshot::load(state.store.as_ref(), id).await?;
    let graph = snapshot.graph();
    let sorted_jobs = graph
        .sorted_layers()
        .into_iter()
        .map(|layer| layer.into_iter().cloned().collect())
        .collect();

    let event = snapshot.event;
    let pull_request = match event.pr_number {
        Some(number) => {
            state
                .store
                .get_pull_request(&event.base.repository, number)
                .await?
        }
        None => None,
    };
    let branch = if pull_request.is_none() {
        state
            .store
            .get_branch(&event.base.repository, &event.base.branch)
            .await?
    } else {
        None
    };

    Ok(Json(EventView {
        event,
        sorted_jobs,
        pull_request,
        branch,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct CanceledResponse {
    canceled: Vec<ResourceId>,
}

async fn cancel_event(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<CanceledResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let message = req.message.unwrap_or_else(|| "Canceled via API".to_string());
    let jobs = state.lifecycle.cancel_event(id, &message).await?;
    Ok(Json(CanceledResponse {
        canceled: jobs.into_iter().map(|j| j.id).collect(),
    }))
}
