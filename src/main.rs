//! code-runner-mcp daemon
//!
//! MCP server that runs code against mounted host directories and installs
//! missing modules before retrying. Base configuration is read from the
//! `CODE_RUNNER_CONFIG` env var; flags override it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use code_runner_mcp::{config::Config, mcp, runner::LocalRunner, supervisor::ExecutionSupervisor};

#[derive(Parser, Debug)]
#[command(name = "code-runner-mcp")]
#[command(about = "MCP server for code execution with automatic dependency installation")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Mount a host directory at a virtual prefix, as HOST=VIRTUAL (repeatable)
    #[arg(long = "mount", value_name = "HOST=VIRTUAL")]
    mounts: Vec<String>,

    /// Pre-built environment to run code in
    #[arg(long)]
    environment_path: Option<PathBuf>,

    /// Create a disposable environment for every request
    #[arg(long)]
    ephemeral: bool,

    /// Maximum run attempts per request
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Per-attempt timeout in seconds
    #[arg(long)]
    timeout_seconds: Option<u64>,
}

impl Args {
    fn apply(self, config: &mut Config) -> Result<()> {
        for spec in &self.mounts {
            config.mounts.push(Config::parse_mount(spec)?);
        }
        if let Some(path) = self.environment_path {
            config.environment_path = Some(path);
        }
        if self.ephemeral {
            config.ephemeral = true;
        }
        if let Some(n) = self.max_attempts {
            config.max_attempts = n;
        }
        if let Some(secs) = self.timeout_seconds {
            config.timeout_seconds = secs;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let stdio = args.stdio;

    let mut config = Config::from_env().context("Failed to load configuration")?;
    args.apply(&mut config).context("Invalid command-line configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        mounts = ?config.mounts.iter().map(|m| &m.virtual_prefix).collect::<Vec<_>>(),
        ephemeral = config.ephemeral,
        max_attempts = config.max_attempts,
        "Loaded configuration"
    );

    let supervisor = ExecutionSupervisor::from_config(&config, LocalRunner::new())?;

    if stdio {
        mcp::serve_stdio(supervisor).await?;
    } else {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    Ok(())
}
