//! Applies the dependency graph of an event to its stored jobs.
//!
//! Evaluation is idempotent and is re-run after every job state change.

use std::collections::HashMap;
use std::sync::Arc;

use conveyor_core::event::Event;
use conveyor_core::graph::{DependencyGraph, JobNode};
use conveyor_core::job::{Job, event_status};
use conveyor_core::recipe::{Cause, Recipe, RecipeDefinition};
use conveyor_core::{ResourceId, Status};
use conveyor_db::Store;
use tracing::{debug, info};

use crate::Result;
use crate::notify::StatusReporter;

pub const WONT_RUN_MESSAGE: &str = "Won't run due to failed dependencies";

/// An event with its jobs and the recipe versions they point at.
pub struct EventSnapshot {
    pub event: Event,
    pub jobs: Vec<Job>,
    pub recipes: HashMap<ResourceId, Recipe>,
}

impl EventSnapshot {
    pub async fn load(store: &dyn Store, event_id: ResourceId) -> Result<Self> {
        let event = store.get_event(event_id).await?;
        let jobs = store.jobs_for_event(event_id).await?;
        let mut recipes = HashMap::new();
        for job in &jobs {
            if !recipes.contains_key(&job.recipe_id) {
                recipes.insert(job.recipe_id, store.get_recipe(job.recipe_id).await?);
            }
        }
        Ok(Self {
            event,
            jobs,
            recipes,
        })
    }

    pub fn recipe(&self, job: &Job) -> Option<&RecipeDefinition> {
        self.recipes.get(&job.recipe_id).map(|r| &r.definition)
    }

    pub fn graph(&self) -> DependencyGraph {
        DependencyGraph::new(
            self.jobs
                .iter()
                .filter_map(|job| self.recipe(job).map(|recipe| JobNode::new(job, recipe)))
                .collect(),
        )
    }
}

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub status: Status,
    pub complete: bool,
    /// Jobs this pass flipped to ready.
    pub newly_ready: Vec<ResourceId>,
    /// Jobs resolved as never running, reported when the event completes.
    pub wont_run: Vec<ResourceId>,
}

pub struct ReadinessEngine {
    store: Arc<dyn Store>,
    reporter: Arc<StatusReporter>,
}

impl ReadinessEngine {
    pub fn new(store: Arc<dyn Store>, reporter: Arc<StatusReporter>) -> Self {
        Self { store, reporter }
    }

    /// Mark newly satisfiable jobs ready, then recompute the event status and
    /// completion and push them to the event's pull request or branch.
    pub async fn evaluate(&self, event_id: ResourceId) -> Result<Evaluation> {
        let mut snapshot = EventSnapshot::load(self.store.as_ref(), event_id).await?;
        let graph = snapshot.graph();

        let mut newly_ready = Vec::new();
        for id in graph.newly_ready() {
            if self.store.mark_ready(id).await? {
                newly_ready.push(id);
            }
        }
        for job in snapshot.jobs.iter_mut() {
            if newly_ready.contains(&job.id) {
                job.ready = true;
            }
        }

        // An event whose only jobs wait for activation is not done yet.
        let has_active = snapshot.jobs.iter().any(|j| j.active);
        let complete = graph.is_done() && (has_active || snapshot.jobs.is_empty());

        let (status, wont_run) = if complete {
            let unrunnable = graph.unrunnable();
            let wont_run: Vec<ResourceId> = snapshot
                .jobs
                .iter()
                .filter(|j| j.active && !j.complete && unrunnable.contains(&j.id))
                .map(|j| j.id)
                .collect();
            (graph.completed_status(), wont_run)
        } else {
            (in_flight_status(&snapshot.jobs), Vec::new())
        };

        self.store
            .set_event_status(event_id, status, complete)
            .await?;
        self.propagate(&snapshot.event, status).await?;

        if complete && !snapshot.event.complete {
            info!(event_id = %event_id, status = %status, "Event complete");
            for job in snapshot.jobs.iter().filter(|j| wont_run.contains(&j.id)) {
                self.store.add_change_log(job.id, WONT_RUN_MESSAGE).await?;
                if let Some(recipe) = snapshot.recipe(job) {
                    self.reporter
                        .job_wont_run(&snapshot.event, job, recipe)
                        .await;
                }
            }
        } else if !newly_ready.is_empty() {
            debug!(event_id = %event_id, ready = newly_ready.len(), "Jobs became ready");
        }

        Ok(Evaluation {
            status,
            complete,
            newly_ready,
            wont_run,
        })
    }

    /// Copy an event status onto its pull request, or onto its branch for
    /// push events.
    pub async fn propagate(&self, event: &Event, status: Status) -> Result<()> {
        if let Some(number) = event.pr_number {
            self.store
                .set_pr_status(&event.base.repository, number, status)
                .await?;
        } else if event.cause == Cause::Push {
            self.store
                .set_branch_status(&event.base.repository, &event.base.branch, status)
                .await?;
        }
        Ok(())
    }
}

/// Status of an event that still has work ahead. Jobs that wait for a
/// developer show through when nothing else has started.
fn in_flight_status(jobs: &[Job]) -> Status {
    let status = event_status(jobs);
    if status == Status::NotStarted && jobs.iter().any(|j| !j.active && !j.complete) {
        Status::ActivationRequired
    } else {
        status
    }
}
