//! Per-event job dependency graph.
//!
//! Edges come from recipe `depends_on` filenames and are resolved against
//! the jobs present in the same event. Filenames are used rather than recipe
//! ids because a recipe may have been superseded between jobs.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::ResourceId;
use crate::job::Job;
use crate::recipe::RecipeDefinition;
use crate::status::{Status, aggregate};

/// The slice of a job and its recipe the graph needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobNode {
    pub id: ResourceId,
    pub filename: String,
    pub depends_on: Vec<String>,
    pub display_name: String,
    pub priority: i32,
    pub config: String,
    pub active: bool,
    pub ready: bool,
    pub complete: bool,
    pub status: Status,
}

impl JobNode {
    pub fn new(job: &Job, recipe: &RecipeDefinition) -> Self {
        Self {
            id: job.id,
            filename: recipe.filename.clone(),
            depends_on: recipe.depends_on.clone(),
            display_name: recipe.display_name.clone(),
            priority: recipe.priority,
            config: job.config.clone(),
            active: job.active,
            ready: job.ready,
            complete: job.complete,
            status: job.status,
        }
    }
}

pub struct DependencyGraph {
    nodes: Vec<JobNode>,
    /// `deps[i]` holds the indices of the jobs node `i` waits on.
    deps: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new(nodes: Vec<JobNode>) -> Self {
        let mut by_filename: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            by_filename.entry(node.filename.as_str()).or_default().push(idx);
        }

        let deps = nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| {
                let mut deps: Vec<usize> = node
                    .depends_on
                    .iter()
                    .filter_map(|filename| by_filename.get(filename.as_str()))
                    .flatten()
                    .copied()
                    .filter(|dep| *dep != idx)
                    .collect();
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .collect();

        Self { nodes, deps }
    }

    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    pub fn dependencies(&self, id: ResourceId) -> Vec<ResourceId> {
        self.index_of(id)
            .map(|idx| self.deps[idx].iter().map(|d| self.nodes[*d].id).collect())
            .unwrap_or_default()
    }

    fn index_of(&self, id: ResourceId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// Jobs that can never run because a dependency, directly or
    /// transitively, failed or was canceled.
    pub fn unrunnable(&self) -> HashSet<ResourceId> {
        let mut wont_run = vec![false; self.nodes.len()];
        loop {
            let mut added = false;
            for (idx, deps) in self.deps.iter().enumerate() {
                if wont_run[idx] {
                    continue;
                }
                let blocked = deps.iter().any(|d| {
                    let dep = &self.nodes[*d];
                    wont_run[*d] || (dep.complete && dep.status.blocks_dependents())
                });
                if blocked {
                    wont_run[idx] = true;
                    added = true;
                }
            }
            if !added {
                break;
            }
        }

        wont_run
            .iter()
            .enumerate()
            .filter(|(_, blocked)| **blocked)
            .map(|(idx, _)| self.nodes[idx].id)
            .collect()
    }

    /// Every active job is either complete or unrunnable.
    pub fn is_done(&self) -> bool {
        let unrunnable = self.unrunnable();
        self.nodes
            .iter()
            .filter(|n| n.active)
            .all(|n| n.complete || unrunnable.contains(&n.id))
    }

    /// Active, incomplete, not-yet-ready jobs whose dependencies have all
    /// completed with a passing status. Jobs already ready are never listed,
    /// so readiness only ever moves from false to true here.
    pub fn newly_ready(&self) -> Vec<ResourceId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.active && !n.complete && !n.ready)
            .filter(|(idx, _)| {
                self.deps[*idx].iter().all(|d| {
                    let dep = &self.nodes[*d];
                    dep.complete && dep.status.satisfies_dependency()
                })
            })
            .map(|(_, n)| n.id)
            .collect()
    }

    /// Final event status: the aggregate of every completed job that was
    /// not knocked out by a failed dependency.
    pub fn completed_status(&self) -> Status {
        let unrunnable = self.unrunnable();
        aggregate(
            self.nodes
                .iter()
                .filter(|n| n.complete && !unrunnable.contains(&n.id))
                .map(|n| n.status),
        )
    }

    /// Partition jobs into display layers. A job joins a layer once all of
    /// its dependencies sit in earlier layers. If no progress is possible the
    /// remainder forms one last layer.
    pub fn sorted_layers(&self) -> Vec<Vec<&JobNode>> {
        let mut placed = vec![false; self.nodes.len()];
        let mut remaining: Vec<usize> = (0..self.nodes.len()).collect();
        let mut layers = Vec::new();

        while !remaining.is_empty() {
            let (mut layer, rest): (Vec<usize>, Vec<usize>) = remaining
                .iter()
                .partition(|idx| self.deps[**idx].iter().all(|d| placed[*d]));

            if layer.is_empty() {
                layer = std::mem::take(&mut remaining);
            } else {
                remaining = rest;
            }
            for idx in &layer {
                placed[*idx] = true;
            }

            let mut nodes: Vec<&JobNode> = layer.iter().map(|idx| &self.nodes[*idx]).collect();
            nodes.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.display_name.cmp(&b.display_name))
                    .then_with(|| a.config.cmp(&b.config))
                    .then_with(|| a.id.cmp(&b.id))
            });
            layers.push(nodes);
        }

        layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(filename: &str, depends_on: &[&str]) -> JobNode {
        JobNode {
            id: ResourceId::new(),
            filename: filename.to_string(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            display_name: filename.to_string(),
            priority: 0,
            config: "linux".to_string(),
            active: true,
            ready: false,
            complete: false,
            status: Status::NotStarted,
        }
    }

    fn finish(node: &mut JobNode, status: Status) {
        node.ready = true;
        node.complete = true;
        node.status = status;
    }

    #[test]
    fn roots_are_ready_dependents_wait() {
        let a = node("a.kdl", &[]);
        let b = node("b.kdl", &["a.kdl"]);
        let (a_id, b_id) = (a.id, b.id);

        let graph = DependencyGraph::new(vec![a, b]);
        assert_eq!(graph.newly_ready(), vec![a_id]);
        assert_eq!(graph.dependencies(b_id), vec![a_id]);
        assert!(!graph.is_done());
    }

    #[test]
    fn passing_dependency_releases_dependent() {
        let mut a = node("a.kdl", &[]);
        let b = node("b.kdl", &["a.kdl"]);
        let b_id = b.id;
        finish(&mut a, Status::Success);

        let graph = DependencyGraph::new(vec![a, b]);
        assert_eq!(graph.newly_ready(), vec![b_id]);
        assert!(graph.unrunnable().is_empty());
    }

    #[test]
    fn allowed_failures_and_skips_satisfy_dependencies() {
        for status in [
            Status::FailedOk,
            Status::IntermittentFailure,
            Status::Skipped,
        ] {
            let mut a = node("a.kdl", &[]);
            let b = node("b.kdl", &["a.kdl"]);
            let b_id = b.id;
            finish(&mut a, status);
            let graph = DependencyGraph::new(vec![a, b]);
            assert_eq!(graph.newly_ready(), vec![b_id], "{status}");
        }
    }

    #[test]
    fn failure_cascades_through_the_chain() {
        let mut a = node("a.kdl", &[]);
        let b = node("b.kdl", &["a.kdl"]);
        let c = node("c.kdl", &["b.kdl"]);
        let (b_id, c_id) = (b.id, c.id);
        finish(&mut a, Status::Failed);

        let graph = DependencyGraph::new(vec![a, b, c]);
        let unrunnable = graph.unrunnable();
        assert!(unrunnable.contains(&b_id));
        assert!(unrunnable.contains(&c_id));
        assert!(graph.newly_ready().is_empty());
        assert!(graph.is_done());
        assert_eq!(graph.completed_status(), Status::Failed);
    }

    #[test]
    fn canceled_dependency_blocks_too() {
        let mut a = node("a.kdl", &[]);
        let b = node("b.kdl", &["a.kdl"]);
        finish(&mut a, Status::Canceled);
        let graph = DependencyGraph::new(vec![a, b]);
        assert!(graph.is_done());
        assert_eq!(graph.completed_status(), Status::Canceled);
    }

    #[test]
    fn dependency_spans_every_config_of_the_recipe() {
        let mut a_linux = node("a.kdl", &[]);
        let mut a_mac = node("a.kdl", &[]);
        a_mac.config = "mac".to_string();
        let b = node("b.kdl", &["a.kdl"]);
        let b_id = b.id;
        finish(&mut a_linux, Status::Success);

        let graph = DependencyGraph::new(vec![a_linux.clone(), a_mac.clone(), b.clone()]);
        assert!(!graph.newly_ready().contains(&b_id));

        finish(&mut a_mac, Status::Success);
        let graph = DependencyGraph::new(vec![a_linux, a_mac, b]);
        assert_eq!(graph.newly_ready(), vec![b_id]);
    }

    #[test]
    fn ready_jobs_are_not_listed_again() {
        let mut a = node("a.kdl", &[]);
        a.ready = true;
        let graph = DependencyGraph::new(vec![a]);
        assert!(graph.newly_ready().is_empty());
    }

    #[test]
    fn inactive_jobs_do_not_hold_the_event_open() {
        let mut a = node("a.kdl", &[]);
        finish(&mut a, Status::Success);
        let mut manual = node("manual.kdl", &[]);
        manual.active = false;
        manual.status = Status::ActivationRequired;

        let graph = DependencyGraph::new(vec![a, manual]);
        assert!(graph.is_done());
        assert_eq!(graph.completed_status(), Status::Success);
    }

    #[test]
    fn missing_dependency_recipes_are_ignored() {
        let b = node("b.kdl", &["not-in-this-event.kdl"]);
        let b_id = b.id;
        let graph = DependencyGraph::new(vec![b]);
        assert_eq!(graph.newly_ready(), vec![b_id]);
    }

    #[test]
    fn layers_follow_dependencies_then_sort_keys() {
        let mut low = node("low.kdl", &[]);
        low.display_name = "Alpha".to_string();
        let mut high = node("high.kdl", &[]);
        high.display_name = "Zulu".to_string();
        high.priority = 10;
        let mut same_name_mac = node("low.kdl", &[]);
        same_name_mac.display_name = "Alpha".to_string();
        same_name_mac.config = "mac".to_string();
        let child = node("child.kdl", &["low.kdl", "high.kdl"]);

        let ids = (low.id, high.id, same_name_mac.id, child.id);
        let graph = DependencyGraph::new(vec![child, same_name_mac, low, high]);
        let layers: Vec<Vec<ResourceId>> = graph
            .sorted_layers()
            .into_iter()
            .map(|layer| layer.into_iter().map(|n| n.id).collect())
            .collect();

        assert_eq!(layers, vec![vec![ids.1, ids.0, ids.2], vec![ids.3]]);
    }

    #[test]
    fn cycles_end_in_a_final_layer() {
        let a = node("a.kdl", &["b.kdl"]);
        let b = node("b.kdl", &["a.kdl"]);
        let root = node("root.kdl", &[]);
        let graph = DependencyGraph::new(vec![a, b, root]);
        let layers = graph.sorted_layers();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].len(), 1);
        assert_eq!(layers[1].len(), 2);
    }
}
