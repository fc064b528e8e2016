//! The agent main loop: poll, claim, run, repeat.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::command::CommandSignal;
use crate::getter::{ClaimedJob, JobGetter};
use crate::interrupt::Interrupts;
use crate::runner::{JobOutcome, JobRunner, RunnerError};
use crate::settings::AgentSettings;
use crate::transport::ServerApi;
use crate::updater::ServerUpdater;

/// How long a finished job may wait for its reports to be delivered, so a
/// server that is briefly down can still receive them.
const FLUSH_WAIT: Duration = Duration::from_secs(2 * 60 * 60);

/// Bound on the updater's final delivery attempt.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(60);

pub struct Agent {
    settings: AgentSettings,
    api: Arc<dyn ServerApi>,
    commands: CommandSignal,
    interrupts: Interrupts,
    flush_wait: Duration,
}

impl Agent {
    pub fn new(
        settings: AgentSettings,
        api: Arc<dyn ServerApi>,
        commands: CommandSignal,
        interrupts: Interrupts,
    ) -> Self {
        Self {
            settings,
            api,
            commands,
            interrupts,
            flush_wait: FLUSH_WAIT,
        }
    }

    pub fn with_flush_wait(mut self, wait: Duration) -> Self {
        self.flush_wait = wait;
        self
    }

    /// Run jobs until a signal arrives, the runner fails, or after the
    /// first job in single-shot mode.
    pub async fn run(&self) -> Result<(), RunnerError> {
        let getter = JobGetter::new(
            self.api.clone(),
            self.settings.servers.clone(),
            self.settings.configs.clone(),
        );
        info!(
            name = %self.settings.name,
            servers = self.settings.servers.len(),
            configs = ?self.settings.configs,
            "Agent started"
        );

        loop {
            let claimed = getter.find_job().await;
            let found = claimed.is_some();
            if let Some(claimed) = claimed {
                self.run_claimed_job(claimed).await?;
            }

            if self.interrupts.received() {
                info!("Received signal, exiting");
                break;
            }
            if self.settings.single_shot {
                break;
            }
            // Right after a job, look for the next one without waiting.
            if !found {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll) => {}
                    _ = self.interrupts.wait() => {
                        info!("Received signal, exiting");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Run one job with a fresh updater, then settle its reports.
    pub async fn run_claimed_job(&self, claimed: ClaimedJob) -> Result<JobOutcome, RunnerError> {
        let job_id = claimed.spec.job_id;
        let updater = ServerUpdater::spawn(
            self.api.clone(),
            self.settings.servers.clone(),
            self.commands.clone(),
            self.settings.server_update_timeout,
            self.settings.server_update_interval,
        );

        let mut runner = JobRunner::new(
            &self.settings,
            claimed.server,
            claimed.spec,
            updater.reports(),
            self.commands.clone(),
        );
        let result = runner.run_job().await;

        let interrupted = matches!(&result, Ok(outcome) if outcome.stopped || outcome.canceled);
        if !interrupted && !updater.flush(self.flush_wait).await {
            warn!(%job_id, "Not all reports were delivered");
        }
        updater.shutdown(SHUTDOWN_WAIT).await;
        self.commands.clear();

        if let Err(e) = &result {
            warn!(%job_id, error = %e, "Runner error, agent will exit");
        }
        result
    }
}
