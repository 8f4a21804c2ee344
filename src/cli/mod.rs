//! Command-line interface for tether.

pub mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Drive MCP tool servers with a bounded agent loop.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "tether: MCP client and agent loop")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one goal against the configured servers
    Run(RunArgs),
    /// Start the servers and list the merged tool directory
    Tools(ToolsArgs),
}

/// Options shared by every command that starts servers.
#[derive(Args, Debug, Clone, Default)]
pub struct ServerArgs {
    /// Server list (.json or .toml); defaults to the per-user config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Tool name to hide from the directory (repeatable)
    #[arg(long = "disallow", value_name = "NAME")]
    pub disallow: Vec<String>,

    /// Expose every tool as <server>__<tool>
    #[arg(long)]
    pub prefix_tools: bool,
}

/// Arguments for `tether run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub servers: ServerArgs,

    /// Maximum act/observe cycles
    #[arg(long)]
    pub max_steps: Option<usize>,

    /// Chat model name (overrides TETHER_MODEL)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Sampling temperature (0.0 - 2.0)
    #[arg(short, long)]
    pub temperature: Option<f64>,

    /// System prompt
    #[arg(short, long)]
    pub system: Option<String>,

    /// The goal to accomplish
    pub goal: String,
}

/// Arguments for `tether tools`.
#[derive(Args, Debug)]
pub struct ToolsArgs {
    #[command(flatten)]
    pub servers: ServerArgs,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
