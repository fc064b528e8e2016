//! A scripted in-memory server for agent tests.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_config::ServerEntry;
use conveyor_core::ResourceId;
use conveyor_core::protocol::{
    ClaimResponse, JobSpec, ReadyJob, ReadyJobs, Reply, StepSpec,
};
use parking_lot::Mutex;

use crate::settings::AgentSettings;
use crate::transport::{Message, ServerApi, TransportError};

type Responder = Box<dyn Fn(&Message) -> Option<Reply> + Send + Sync>;

#[derive(Default)]
pub struct FakeServer {
    ready: Mutex<Vec<ReadyJob>>,
    specs: Mutex<HashMap<ResourceId, JobSpec>>,
    posted: Mutex<Vec<Message>>,
    failures: Mutex<usize>,
    responder: Mutex<Option<Responder>>,
    claims: Mutex<Vec<(String, ResourceId)>>,
    pings: Mutex<usize>,
    down: Mutex<bool>,
}

impl FakeServer {
    /// Offer `spec` as ready for `config`; the first claim wins it.
    pub fn offer(&self, config: &str, spec: JobSpec) {
        self.ready.lock().push(ReadyJob {
            id: spec.job_id,
            config: config.to_string(),
        });
        self.specs.lock().insert(spec.job_id, spec);
    }

    /// List a job that somebody else will always win.
    pub fn offer_taken(&self, config: &str, job_id: ResourceId) {
        self.ready.lock().push(ReadyJob {
            id: job_id,
            config: config.to_string(),
        });
    }

    pub fn posted(&self) -> Vec<Message> {
        self.posted.lock().clone()
    }

    pub fn claims(&self) -> Vec<(String, ResourceId)> {
        self.claims.lock().clone()
    }

    pub fn pings(&self) -> usize {
        *self.pings.lock()
    }

    /// The next `count` posts fail as if the server were unreachable.
    pub fn fail_posts(&self, count: usize) {
        *self.failures.lock() = count;
    }

    pub fn set_down(&self, down: bool) {
        *self.down.lock() = down;
    }

    pub fn respond_with(&self, f: impl Fn(&Message) -> Option<Reply> + Send + Sync + 'static) {
        *self.responder.lock() = Some(Box::new(f));
    }

    fn unreachable(&self, server: &ServerEntry) -> TransportError {
        TransportError::Request {
            url: server.url.clone(),
            message: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl ServerApi for FakeServer {
    async fn ready_jobs(
        &self,
        server: &ServerEntry,
        configs: &[String],
    ) -> Result<ReadyJobs, TransportError> {
        if *self.down.lock() {
            return Err(self.unreachable(server));
        }
        let jobs = self
            .ready
            .lock()
            .iter()
            .filter(|job| configs.contains(&job.config))
            .cloned()
            .collect();
        Ok(ReadyJobs { jobs })
    }

    async fn claim_job(
        &self,
        server: &ServerEntry,
        config: &str,
        job_id: ResourceId,
    ) -> Result<ClaimResponse, TransportError> {
        if *self.down.lock() {
            return Err(self.unreachable(server));
        }
        self.claims.lock().push((config.to_string(), job_id));
        self.ready.lock().retain(|job| job.id != job_id);
        let spec = self.specs.lock().remove(&job_id);
        Ok(ClaimResponse {
            success: spec.is_some(),
            message: if spec.is_some() {
                "Success".to_string()
            } else {
                "Job is not available".to_string()
            },
            job_id,
            job_info: spec,
        })
    }

    async fn post(&self, server: &ServerEntry, message: &Message) -> Result<Reply, TransportError> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 || *self.down.lock() {
                *failures = failures.saturating_sub(1);
                return Err(self.unreachable(server));
            }
        }
        self.posted.lock().push(message.clone());
        let reply = self
            .responder
            .lock()
            .as_ref()
            .and_then(|f| f(message))
            .unwrap_or_else(|| Reply::ok("Message received"));
        Ok(reply)
    }

    async fn ping(&self, server: &ServerEntry) -> Result<Reply, TransportError> {
        if *self.down.lock() {
            return Err(self.unreachable(server));
        }
        *self.pings.lock() += 1;
        Ok(Reply::ok("Pong"))
    }
}

pub fn server_entry() -> ServerEntry {
    ServerEntry {
        url: "https://ci.example.org".to_string(),
        build_key: "key".to_string(),
        verify_ssl: true,
    }
}

/// Settings tuned so tests run in well under a second per step.
pub fn settings(build_root: &Path) -> AgentSettings {
    AgentSettings {
        name: "test-agent".to_string(),
        servers: vec![server_entry()],
        configs: vec!["linux".to_string()],
        build_root: build_root.to_path_buf(),
        poll: Duration::from_millis(10),
        update_step_time: Duration::from_millis(100),
        server_update_interval: Duration::from_secs(60),
        server_update_timeout: Duration::from_millis(10),
        request_timeout: Duration::from_secs(5),
        max_output_size: 5 * 1024 * 1024,
        max_step_time: Duration::from_secs(60),
        single_shot: false,
        environment: vec![],
    }
}

fn var(name: &str, value: &str) -> (String, String) {
    (name.to_string(), value.to_string())
}

/// A job whose steps run the given `(name, script)` pairs.
pub fn job_spec(steps: &[(&str, &str)]) -> JobSpec {
    JobSpec {
        job_id: ResourceId::new(),
        recipe_name: "Widgets".to_string(),
        abort_on_failure: true,
        environment: vec![
            var("CONVEYOR_BASE_REPO", "acme/widgets"),
            var("CONVEYOR_BUILD_CONFIG", "linux"),
            var("RECIPE_LEVEL", "recipe"),
        ],
        prestep_sources: vec!["function greet() { echo \"hello $1\"; }".to_string()],
        steps: steps
            .iter()
            .enumerate()
            .map(|(i, (name, script))| StepSpec {
                step_num: i as i32,
                step_name: name.to_string(),
                step_abort_on_failure: true,
                step_allowed_to_fail: false,
                stepresult_id: ResourceId::new(),
                environment: vec![
                    var("CONVEYOR_STEP_NUM", &i.to_string()),
                    var("CONVEYOR_STEP_NAME", name),
                ],
                script: script.to_string(),
            })
            .collect(),
    }
}
