//! Application state.

use std::sync::Arc;

use conveyor_config::ServerConfig;
use conveyor_core::host::GitHost;
use conveyor_db::Store;
use conveyor_scheduler::{
    DispatchService, EventController, ReadinessEngine, RecipeCatalog, StatusReporter,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<ServerConfig>,
    pub readiness: Arc<ReadinessEngine>,
    pub lifecycle: Arc<EventController>,
    pub dispatch: Arc<DispatchService>,
    pub catalog: Arc<RecipeCatalog>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, host: Arc<dyn GitHost>, config: ServerConfig) -> Self {
        let config = Arc::new(config);
        let reporter = Arc::new(StatusReporter::new(host, config.clone()));
        let readiness = Arc::new(ReadinessEngine::new(store.clone(), reporter.clone()));
        let lifecycle = Arc::new(EventController::new(
            store.clone(),
            readiness.clone(),
            reporter.clone(),
            config.clone(),
        ));
        let dispatch = Arc::new(DispatchService::new(
            store.clone(),
            readiness.clone(),
            lifecycle.clone(),
            reporter,
            config.clone(),
        ));
        let catalog = Arc::new(RecipeCatalog::new(store.clone()));

        Self {
            store,
            config,
            readiness,
            lifecycle,
            dispatch,
            catalog,
        }
    }
}
