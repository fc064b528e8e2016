//! Runs the steps of one claimed job.
//!
//! Each step becomes a bash script in its own process group. Output is
//! collected line by line, sent to the server in chunks every
//! `update_step_time`, and capped at `max_output_size`. A pending command
//! or the step time limit kills the whole group.

use std::collections::BTreeMap;
use std::time::Duration;

use conveyor_config::ServerEntry;
use conveyor_core::protocol::{
    Command, ENV_PREFIX, EXIT_INTERMITTENT_FAILURE, EXIT_SKIP, JobFinishedReport, JobSpec,
    StepReport, StepSpec,
};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::command::CommandSignal;
use crate::process;
use crate::settings::AgentSettings;
use crate::transport::Message;
use crate::updater::{Outbound, ReportSender};

/// Values starting with this token get the local build root instead.
const BUILD_ROOT_TOKEN: &str = "BUILD_ROOT";

/// How long to keep reading output after the step process is gone.
const OUTPUT_DRAIN_WAIT: Duration = Duration::from_secs(5);

const BANNER_RULE: &str = "*****************************************************";

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Could not write step script: {0}")]
    Script(#[source] std::io::Error),

    #[error("Could not wait for step process: {0}")]
    Wait(#[source] std::io::Error),
}

/// How a job run ended, as far as the agent is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutcome {
    pub canceled: bool,
    pub stopped: bool,
    pub failed: bool,
    pub seconds: i64,
}

fn env_name(name: &str) -> String {
    format!("{}{}", ENV_PREFIX, name)
}

fn replace_build_root(value: &str, build_root: &str) -> String {
    match value.strip_prefix(BUILD_ROOT_TOKEN) {
        Some(rest) => format!("{}{}", build_root, rest),
        None => value.to_string(),
    }
}

fn joined_keys<'a>(keys: impl Iterator<Item = &'a String>) -> String {
    let mut keys: Vec<&str> = keys.map(String::as_str).collect();
    keys.sort_unstable();
    keys.join(" ")
}

fn output_limit_banner(limit: usize) -> String {
    format!(
        "\n\n{rule}\n\nConveyor: Output size exceeded limit ({limit} bytes), further output will not be displayed!\n\n{rule}\n",
        rule = BANNER_RULE,
    )
}

fn step_time_banner(limit: Duration) -> String {
    format!(
        "\n\n{rule}\nConveyor: Cancelling job due to step taking longer than the max {} seconds\n\n{rule}\n",
        limit.as_secs(),
        rule = BANNER_RULE,
    )
}

/// Step output, capped once it reaches the limit.
struct CapturedOutput {
    full: String,
    chunk: String,
    limit: usize,
    over_limit: bool,
}

impl CapturedOutput {
    fn new(limit: usize) -> Self {
        Self {
            full: String::new(),
            chunk: String::new(),
            limit,
            over_limit: false,
        }
    }

    fn push(&mut self, line: &str) {
        if self.over_limit {
            return;
        }
        let room = self.limit.saturating_sub(self.full.len());
        if line.len() < room {
            self.full.push_str(line);
            self.chunk.push_str(line);
            return;
        }

        let mut cut = room;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        self.full.push_str(&line[..cut]);
        self.chunk.push_str(&line[..cut]);
        self.full.push_str(&output_limit_banner(self.limit));
        self.over_limit = true;
    }

    fn append(&mut self, text: &str) {
        self.full.push_str(text);
    }

    fn take_chunk(&mut self) -> String {
        std::mem::take(&mut self.chunk)
    }
}

pub struct JobRunner<'a> {
    settings: &'a AgentSettings,
    server: ServerEntry,
    job: JobSpec,
    reports: ReportSender,
    commands: CommandSignal,
    /// Agent environment overlaid with the job's.
    base_env: BTreeMap<String, String>,
    client_vars: Vec<String>,
    recipe_vars: Vec<String>,
    sources: String,
    canceled: bool,
    stopped: bool,
    spawn_failed: bool,
}

impl<'a> JobRunner<'a> {
    pub fn new(
        settings: &'a AgentSettings,
        server: ServerEntry,
        job: JobSpec,
        reports: ReportSender,
        commands: CommandSignal,
    ) -> Self {
        let root = settings.build_root.to_string_lossy().into_owned();
        let mut base_env = BTreeMap::new();
        for (name, value) in &settings.environment {
            base_env.insert(name.clone(), replace_build_root(value, &root));
        }
        for (name, value) in &job.environment {
            base_env.insert(name.clone(), replace_build_root(value, &root));
        }

        let sources = job
            .prestep_sources
            .iter()
            .map(|source| format!("{}\n", source.replace('\r', "")))
            .collect();

        Self {
            settings,
            server,
            client_vars: settings.environment.iter().map(|(k, _)| k.clone()).collect(),
            recipe_vars: job.environment.iter().map(|(k, _)| k.clone()).collect(),
            job,
            reports,
            commands,
            base_env,
            sources,
            canceled: false,
            stopped: false,
            spawn_failed: false,
        }
    }

    fn send(&self, message: Message) {
        self.reports.send(Outbound {
            server: self.server.clone(),
            job_id: self.job.job_id,
            message,
        });
    }

    fn absorb(&mut self, command: Command) {
        match command {
            Command::Cancel => {
                info!(job_id = %self.job.job_id, "Read cancel command");
                self.canceled = true;
            }
            Command::Stop => {
                info!(job_id = %self.job.job_id, "Read stop command");
                self.stopped = true;
            }
        }
    }

    fn step_report(&self, step: &StepSpec) -> StepReport {
        StepReport {
            client_name: self.settings.name.clone(),
            job_id: Some(self.job.job_id),
            step_num: step.step_num,
            ..StepReport::default()
        }
    }

    /// The full environment of one step. Step values win over the job's,
    /// which win over the agent's.
    pub fn step_environment(&self, step: &StepSpec) -> BTreeMap<String, String> {
        let root = self.settings.build_root.to_string_lossy().into_owned();
        let step_vars: BTreeMap<String, String> = step
            .environment
            .iter()
            .map(|(name, value)| (name.clone(), replace_build_root(value, &root)))
            .collect();

        let recipe_vars: Vec<&String> = self
            .recipe_vars
            .iter()
            .filter(|name| !step_vars.contains_key(*name))
            .collect();
        let client_vars = self.client_vars.iter().filter(|name| {
            !step_vars.contains_key(*name) && !self.recipe_vars.contains(*name)
        });

        let mut env = self.base_env.clone();
        env.insert(
            env_name("RECIPE_VARS"),
            joined_keys(recipe_vars.into_iter()),
        );
        env.insert(env_name("CLIENT_VARS"), joined_keys(client_vars));
        env.insert(env_name("STEP_VARS"), joined_keys(step_vars.keys()));
        env.extend(step_vars);
        env.insert(env_name("CLIENT_NAME"), self.settings.name.clone());
        env.insert(env_name("BUILD_ROOT"), root);
        env
    }

    fn step_time_limit(&self, env: &BTreeMap<String, String>) -> Duration {
        env.get(&env_name("MAX_STEP_TIME"))
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.settings.max_step_time)
    }

    /// Run every step, then queue the job-finished report.
    ///
    /// A runner error still reports the job as finished before it is
    /// returned.
    pub async fn run_job(&mut self) -> Result<JobOutcome, RunnerError> {
        let started = Instant::now();
        info!(
            job_id = %self.job.job_id,
            recipe = %self.job.recipe_name,
            server = %self.server.url,
            "Starting job"
        );

        let mut steps = self.job.steps.clone();
        steps.sort_by_key(|step| step.step_num);

        let mut canceled = false;
        let mut failed = false;
        let mut failure = None;
        for step in &steps {
            if let Some(command) = self.commands.current() {
                self.absorb(command);
            }
            if self.canceled {
                canceled = true;
                break;
            }
            if self.stopped {
                break;
            }

            let report = match self.run_step(step).await {
                Ok(report) => report,
                Err(e) => {
                    error!(job_id = %self.job.job_id, step = %step.step_name, error = %e, "Step could not run");
                    let mut report = self.step_report(step);
                    report.output = format!("Conveyor agent error, canceling job: {}", e);
                    report.exit_status = 1;
                    report.complete = true;
                    self.send(Message::StepCompleted {
                        stepresult_id: step.stepresult_id,
                        report,
                    });
                    canceled = true;
                    failed = true;
                    failure = Some(e);
                    break;
                }
            };

            if self.spawn_failed {
                failed = true;
                break;
            }
            if self.stopped {
                info!(job_id = %self.job.job_id, "Stopping job");
                break;
            }
            if self.canceled {
                info!(job_id = %self.job.job_id, "Canceling job");
                canceled = true;
                break;
            }
            if report.exit_status == EXIT_SKIP {
                info!(job_id = %self.job.job_id, step = %step.step_name, "Step skipped");
                break;
            }
            if report.exit_status != 0
                && report.exit_status != EXIT_INTERMITTENT_FAILURE
                && step.step_abort_on_failure
                && self.job.abort_on_failure
            {
                info!(job_id = %self.job.job_id, step = %step.step_name, "Step failed, stopping");
                failed = true;
                break;
            }
        }

        let seconds = started.elapsed().as_secs() as i64;
        self.send(Message::JobFinished {
            job_id: self.job.job_id,
            report: JobFinishedReport {
                client_name: self.settings.name.clone(),
                seconds,
                complete: true,
                canceled,
            },
        });
        info!(job_id = %self.job.job_id, recipe = %self.job.recipe_name, seconds, "Finished job");

        match failure {
            Some(e) => Err(e),
            None => Ok(JobOutcome {
                canceled,
                stopped: self.stopped,
                failed,
                seconds,
            }),
        }
    }

    async fn run_step(&mut self, step: &StepSpec) -> Result<StepReport, RunnerError> {
        info!(job_id = %self.job.job_id, step = %step.step_name, "Starting step");
        let started = Instant::now();
        let mut report = self.step_report(step);
        self.send(Message::StepStarted {
            stepresult_id: step.stepresult_id,
            report: report.clone(),
        });

        let env = self.step_environment(step);
        let limit = self.step_time_limit(&env);
        let env: Vec<(String, String)> = env.into_iter().collect();
        let script = process::write_script(&env, &self.sources, &step.script.replace('\r', ""))
            .map_err(RunnerError::Script)?;

        let mut child = match process::spawn(script.path(), &self.settings.build_root) {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Couldn't create process: {}", e);
                error!(job_id = %self.job.job_id, step = %step.step_name, "{}", message);
                self.stopped = true;
                self.spawn_failed = true;
                report.output = message;
                report.exit_status = 1;
                report.complete = true;
                report.time = started.elapsed().as_secs() as i64;
                self.send(Message::StepCompleted {
                    stepresult_id: step.stepresult_id,
                    report: report.clone(),
                });
                return Ok(report);
            }
        };

        let pid = child.id();
        let mut lines = process::merge_output(&mut child);
        let mut output = CapturedOutput::new(self.settings.max_output_size);
        let commands = self.commands.clone();
        let deadline = started + limit;
        let mut next_update = Instant::now() + self.settings.update_step_time;
        let mut lines_open = true;
        let mut keep_output = false;

        let exited = loop {
            tokio::select! {
                status = child.wait() => break Some(status.map_err(RunnerError::Wait)?),
                line = lines.recv(), if lines_open => match line {
                    Some(line) => output.push(&line),
                    None => lines_open = false,
                },
                _ = tokio::time::sleep_until(next_update) => {
                    report.output = output.take_chunk();
                    report.time = started.elapsed().as_secs() as i64;
                    self.send(Message::StepUpdated {
                        stepresult_id: step.stepresult_id,
                        report: report.clone(),
                    });
                    next_update = Instant::now() + self.settings.update_step_time;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(job_id = %self.job.job_id, step = %step.step_name, limit = limit.as_secs(), "Step took too long");
                    output.append(&step_time_banner(limit));
                    self.canceled = true;
                    keep_output = true;
                    break None;
                }
                command = commands.raised() => {
                    self.absorb(command);
                    break None;
                }
            }
        };

        let exit_status = match exited {
            Some(status) => {
                if let Some(pid) = pid {
                    process::reap_group(pid);
                }
                process::exit_code(status)
            }
            None => {
                info!(job_id = %self.job.job_id, step = %step.step_name, "Killing step");
                process::kill_group(&mut child).await;
                report.canceled = true;
                match tokio::time::timeout(Duration::from_secs(1), child.wait()).await {
                    Ok(status) => process::exit_code(status.map_err(RunnerError::Wait)?),
                    Err(_) => 1,
                }
            }
        };

        if lines_open {
            let drain = async {
                while let Some(line) = lines.recv().await {
                    output.push(&line);
                }
            };
            if tokio::time::timeout(OUTPUT_DRAIN_WAIT, drain).await.is_err() {
                warn!(job_id = %self.job.job_id, step = %step.step_name, "Step left processes holding its output open");
            }
        }

        report.exit_status = exit_status;
        report.output = if report.canceled && !keep_output {
            String::new()
        } else {
            output.full
        };
        report.complete = true;
        report.time = started.elapsed().as_secs() as i64;
        self.send(Message::StepCompleted {
            stepresult_id: step.stepresult_id,
            report: report.clone(),
        });
        Ok(report)
    }
}
