mod analyze;
mod get;
mod refresh;

use std::path::Path;

use flowlens_core::{ApiClient, ClientConfig};
use serde_json::Value;
use tracing::debug;

use crate::cli::{Cli, Command};
use crate::error::CliError;

/// Broadcast capacity for one CLI invocation's progress and result events.
const EVENT_CAPACITY: usize = 1024;

pub struct CommandResult {
    pub data: Value,
    /// Upstream or pipeline failures reported inside `data`.
    pub failures: usize,
}

impl CommandResult {
    pub fn new(data: Value, failures: usize) -> Self {
        Self { data, failures }
    }
}

pub async fn run(cli: &Cli) -> Result<CommandResult, CliError> {
    let config = load_config(cli.config.as_deref())?;
    let client = ApiClient::builder(config.clone()).build()?;
    if config.cache.enabled {
        let _sweeper = client.cache().spawn_sweeper(config.cache.cleanup_interval());
    }
    debug!(base_url = client.base_url(), "client ready");

    match &cli.command {
        Command::Get(args) => get::run(args, &client).await,
        Command::Analyze(args) => analyze::run(args, client, &config).await,
        Command::Refresh(args) => refresh::run(args, client, &config).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<ClientConfig, CliError> {
    let config = match path {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::from_env()?,
    };
    Ok(config)
}
