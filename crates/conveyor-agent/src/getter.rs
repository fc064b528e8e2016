//! Finding and claiming work across servers.

use std::sync::Arc;

use conveyor_config::ServerEntry;
use conveyor_core::protocol::JobSpec;
use tracing::{debug, info, warn};

use crate::transport::ServerApi;

/// A job this agent won, with the server it came from.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub server: ServerEntry,
    pub config: String,
    pub spec: JobSpec,
}

pub struct JobGetter {
    api: Arc<dyn ServerApi>,
    servers: Vec<ServerEntry>,
    configs: Vec<String>,
}

impl JobGetter {
    pub fn new(api: Arc<dyn ServerApi>, servers: Vec<ServerEntry>, configs: Vec<String>) -> Self {
        Self {
            api,
            servers,
            configs,
        }
    }

    /// Ask each server in turn for ready jobs and claim the first one we
    /// can win. Unreachable servers are skipped until the next poll.
    pub async fn find_job(&self) -> Option<ClaimedJob> {
        for server in &self.servers {
            let ready = match self.api.ready_jobs(server, &self.configs).await {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(server = %server.url, error = %e, "Could not get ready jobs");
                    continue;
                }
            };
            debug!(server = %server.url, count = ready.jobs.len(), "Ready jobs");

            for job in ready.jobs {
                if !self.configs.contains(&job.config) {
                    continue;
                }
                let response = match self.api.claim_job(server, &job.config, job.id).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(server = %server.url, job_id = %job.id, error = %e, "Claim failed");
                        continue;
                    }
                };
                match (response.success, response.job_info) {
                    (true, Some(spec)) => {
                        info!(server = %server.url, job_id = %job.id, config = %job.config, "Claimed job");
                        return Some(ClaimedJob {
                            server: server.clone(),
                            config: job.config,
                            spec,
                        });
                    }
                    (true, None) => {
                        warn!(job_id = %job.id, "Claim succeeded without a job specification");
                    }
                    (false, _) => {
                        debug!(job_id = %job.id, message = %response.message, "Lost claim");
                    }
                }
            }
        }
        None
    }
}
