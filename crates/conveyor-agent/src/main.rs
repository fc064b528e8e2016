//! Conveyor worker agent

use std::sync::Arc;

use clap::Parser;
use conveyor_agent::{Agent, AgentArgs, AgentSettings, CommandSignal, HttpServerApi, Interrupts};
use conveyor_config::{AgentFile, parse_agent_config};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = AgentArgs::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let file = match &args.config_file {
        Some(path) => parse_agent_config(&std::fs::read_to_string(path)?)?,
        None => AgentFile::default(),
    };
    let settings = AgentSettings::resolve(&args, file)?;
    std::fs::create_dir_all(&settings.build_root)?;
    info!(build_root = %settings.build_root.display(), "Using build root");

    let api = Arc::new(HttpServerApi::new(
        settings.name.clone(),
        settings.request_timeout,
    )?);
    let commands = CommandSignal::new();
    let interrupts = Interrupts::new(commands.clone());
    let _signals = interrupts.listen()?;

    Agent::new(settings, api, commands, interrupts).run().await?;
    info!("Agent exiting");
    Ok(())
}
