//! HTTP routes.

pub mod client;
pub mod events;
pub mod health;
pub mod jobs;

use axum::Router;

use crate::AppState;

/// Build the main router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/client", client::router())
        .nest("/api/v1", api_router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/events", events::router())
        .nest("/jobs", jobs::router())
}
