//! CLI interface for remexec

use crate::agent::Agent;
use crate::config::{load_config, resolve_config_path, AgentConfig};
use crate::logging::{init_logging, LogConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

/// Operating environment that forces debug logging
const DEVELOPMENT_ENV: &str = "DEVELOPMENT";

/// remexec - remote command execution agent
#[derive(Parser, Debug)]
#[command(name = "remexec")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Runs remote commands over SSH, Telnet and WinRM on behalf of a message broker", long_about = None)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json", global = true)]
    pub log_format: String,

    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Configuration section to use (PRODUCTION or DEVELOPMENT)
    #[arg(short, long, default_value = "PRODUCTION", global = true)]
    pub env: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent and consume tasks until SIGINT/SIGTERM
    Run,

    /// Print the resolved configuration with secrets masked
    Config,
}

impl Cli {
    /// Load configuration for the selected environment
    pub fn load_config(&self) -> anyhow::Result<AgentConfig> {
        if let Some(path) = &self.config {
            if !path.exists() {
                anyhow::bail!("Config file {:?} does not exist", path);
            }
        }
        let path = resolve_config_path(self.config.as_deref());
        Ok(load_config(path.as_deref(), &self.env)?)
    }

    /// Logging settings from flags, raised to debug by config or environment
    pub fn log_config(&self, config: &AgentConfig) -> LogConfig {
        let force = config.debug || self.env.eq_ignore_ascii_case(DEVELOPMENT_ENV);
        LogConfig::new(&self.log_level, &self.log_format).force_debug(force)
    }

    /// Initialize logging based on CLI arguments and configuration
    pub fn init_logging(&self, config: &AgentConfig) -> anyhow::Result<()> {
        init_logging(&self.log_config(config))
    }

    /// Execute the CLI command
    pub async fn execute(&self, config: AgentConfig) -> anyhow::Result<()> {
        match &self.command {
            Commands::Run => {
                info!("Environment: {}", self.env);
                info!("Broker: {}", config.broker.masked_url());
                Agent::new(config).run().await?;
            }
            Commands::Config => {
                println!("{}", serde_json::to_string_pretty(&config.masked())?);
            }
        }
        Ok(())
    }
}
