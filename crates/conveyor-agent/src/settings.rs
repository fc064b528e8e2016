//! Agent settings: command-line flags layered over `agent.kdl`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use conveyor_config::{AgentFile, ConfigError, ConfigResult, ServerEntry};

const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_UPDATE_STEP_TIME_SECS: u64 = 20;
const DEFAULT_SERVER_UPDATE_INTERVAL_SECS: u64 = 20;
const DEFAULT_SERVER_UPDATE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_OUTPUT_SIZE: u64 = 5 * 1024 * 1024;
const DEFAULT_MAX_STEP_TIME_SECS: u64 = 6 * 60 * 60;

#[derive(Debug, Default, Parser)]
#[command(name = "conveyor-agent")]
#[command(about = "Runs Conveyor CI jobs on this machine", long_about = None)]
#[command(version)]
pub struct AgentArgs {
    /// Server to poll for jobs, may be repeated
    #[arg(long = "server")]
    pub servers: Vec<String>,

    /// Build key for the servers given with --server
    #[arg(long, env = "CONVEYOR_BUILD_KEY")]
    pub build_key: Option<String>,

    /// Build configuration this machine can run, may be repeated
    #[arg(long = "config")]
    pub configs: Vec<String>,

    /// Name reported to the servers, defaults to the hostname
    #[arg(long)]
    pub name: Option<String>,

    /// Seconds between polls when there is no work
    #[arg(long)]
    pub poll: Option<u64>,

    /// Seconds between output updates of a running step
    #[arg(long)]
    pub update_step_time: Option<u64>,

    /// Ping servers not contacted for this many seconds
    #[arg(long)]
    pub server_update_interval: Option<u64>,

    /// Seconds the updater waits for new reports before sending
    #[arg(long)]
    pub server_update_timeout: Option<u64>,

    /// Seconds before a request to a server times out
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Stop collecting step output after this many bytes
    #[arg(long)]
    pub max_output_size: Option<u64>,

    /// Cancel a step that runs longer than this many seconds
    #[arg(long)]
    pub max_step_time: Option<u64>,

    /// Working directory for build scripts
    #[arg(long)]
    pub build_root: Option<PathBuf>,

    /// Do not verify server certificates
    #[arg(long)]
    pub insecure: bool,

    /// Exit after one job
    #[arg(long)]
    pub single_shot: bool,

    /// Log as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Agent configuration file (agent.kdl)
    #[arg(long)]
    pub config_file: Option<PathBuf>,
}

/// Fully resolved agent configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub name: String,
    pub servers: Vec<ServerEntry>,
    pub configs: Vec<String>,
    pub build_root: PathBuf,
    pub poll: Duration,
    pub update_step_time: Duration,
    pub server_update_interval: Duration,
    pub server_update_timeout: Duration,
    pub request_timeout: Duration,
    pub max_output_size: usize,
    pub max_step_time: Duration,
    pub single_shot: bool,
    /// Lowest-priority environment for every step.
    pub environment: Vec<(String, String)>,
}

fn seconds(flag: Option<u64>, file: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(flag.or(file).unwrap_or(default))
}

fn default_name() -> ConfigResult<String> {
    nix::unistd::gethostname()
        .map_err(|e| ConfigError::Io(e.into()))?
        .into_string()
        .map_err(|_| ConfigError::InvalidValue {
            field: "name".to_string(),
            message: "hostname is not valid UTF-8".to_string(),
        })
}

impl AgentSettings {
    /// Merge flags over the file; flags win, and list flags replace the
    /// file's list instead of extending it.
    pub fn resolve(args: &AgentArgs, file: AgentFile) -> ConfigResult<Self> {
        let servers = if args.servers.is_empty() {
            file.servers
        } else {
            let build_key = args
                .build_key
                .clone()
                .ok_or_else(|| ConfigError::MissingField("build-key".to_string()))?;
            args.servers
                .iter()
                .map(|url| ServerEntry {
                    url: url.clone(),
                    build_key: build_key.clone(),
                    verify_ssl: true,
                })
                .collect()
        };
        let servers: Vec<ServerEntry> = servers
            .into_iter()
            .map(|server| ServerEntry {
                verify_ssl: server.verify_ssl && !args.insecure,
                ..server
            })
            .collect();
        if servers.is_empty() {
            return Err(ConfigError::MissingField("server".to_string()));
        }

        let configs = if args.configs.is_empty() {
            file.configs
        } else {
            args.configs.clone()
        };
        if configs.is_empty() {
            return Err(ConfigError::MissingField("config".to_string()));
        }

        let name = match args.name.clone().or(file.name) {
            Some(name) => name,
            None => default_name()?,
        };
        let build_root = match args.build_root.clone().or(file.build_root) {
            Some(root) => root,
            None => std::env::current_dir()?,
        };
        let max_output_size = args
            .max_output_size
            .or(file.max_output_size)
            .unwrap_or(DEFAULT_MAX_OUTPUT_SIZE);

        Ok(Self {
            name,
            servers,
            configs,
            build_root,
            poll: seconds(args.poll, file.poll_secs, DEFAULT_POLL_SECS),
            update_step_time: seconds(
                args.update_step_time,
                file.update_step_time_secs,
                DEFAULT_UPDATE_STEP_TIME_SECS,
            ),
            server_update_interval: seconds(
                args.server_update_interval,
                file.server_update_interval_secs,
                DEFAULT_SERVER_UPDATE_INTERVAL_SECS,
            ),
            server_update_timeout: seconds(
                args.server_update_timeout,
                file.server_update_timeout_secs,
                DEFAULT_SERVER_UPDATE_TIMEOUT_SECS,
            ),
            request_timeout: seconds(
                args.request_timeout,
                file.request_timeout_secs,
                DEFAULT_REQUEST_TIMEOUT_SECS,
            ),
            max_output_size: usize::try_from(max_output_size).unwrap_or(usize::MAX),
            max_step_time: seconds(
                args.max_step_time,
                file.max_step_time_secs,
                DEFAULT_MAX_STEP_TIME_SECS,
            ),
            single_shot: args.single_shot || file.single_shot.unwrap_or(false),
            environment: file
                .environment
                .into_iter()
                .map(|var| (var.name, var.value))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_config::parse_agent_config;

    fn args(extra: &[&str]) -> AgentArgs {
        let mut argv = vec!["conveyor-agent", "--name", "box"];
        argv.extend_from_slice(extra);
        AgentArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_fill_gaps() {
        let settings = AgentSettings::resolve(
            &args(&[
                "--server",
                "https://ci.example.org",
                "--build-key",
                "abc",
                "--config",
                "linux",
                "--build-root",
                "/tmp/builds",
            ]),
            AgentFile::default(),
        )
        .unwrap();

        assert_eq!(settings.name, "box");
        assert_eq!(settings.poll, Duration::from_secs(30));
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.update_step_time, Duration::from_secs(20));
        assert_eq!(settings.server_update_interval, Duration::from_secs(20));
        assert_eq!(settings.server_update_timeout, Duration::from_secs(5));
        assert_eq!(settings.max_output_size, 5 * 1024 * 1024);
        assert_eq!(settings.max_step_time, Duration::from_secs(6 * 60 * 60));
        assert!(!settings.single_shot);
        assert_eq!(
            settings.servers,
            vec![ServerEntry {
                url: "https://ci.example.org".to_string(),
                build_key: "abc".to_string(),
                verify_ssl: true,
            }]
        );
    }

    #[test]
    fn test_flags_override_file() {
        let file = parse_agent_config(
            r#"
            agent {
                name "from-file"
                poll 10
                max-step-time 60
                single-shot #true
            }
            server "https://file.example.org" build-key="file-key"
            configs "linux" "mac"
            env {
                JOBS "4"
            }
            "#,
        )
        .unwrap();

        let settings = AgentSettings::resolve(
            &args(&["--poll", "3", "--config", "windows", "--insecure"]),
            file,
        )
        .unwrap();

        assert_eq!(settings.name, "box");
        assert_eq!(settings.poll, Duration::from_secs(3));
        assert_eq!(settings.max_step_time, Duration::from_secs(60));
        assert!(settings.single_shot);
        assert_eq!(settings.configs, vec!["windows"]);
        assert_eq!(settings.servers[0].url, "https://file.example.org");
        assert!(!settings.servers[0].verify_ssl);
        assert_eq!(
            settings.environment,
            vec![("JOBS".to_string(), "4".to_string())]
        );
    }

    #[test]
    fn test_server_flag_needs_build_key() {
        let err = AgentSettings::resolve(
            &args(&["--server", "https://ci.example.org", "--config", "linux"]),
            AgentFile::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(field) if field == "build-key"));
    }

    #[test]
    fn test_servers_and_configs_required() {
        let err = AgentSettings::resolve(&args(&["--config", "linux"]), AgentFile::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(field) if field == "server"));

        let err = AgentSettings::resolve(
            &args(&["--server", "https://ci.example.org", "--build-key", "k"]),
            AgentFile::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(field) if field == "config"));
    }
}
