//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - simulate: run a synthetic workload through the configured fleet
//! - config: print the effective configuration
//! - checkpoint: list the pending tasks in a checkpoint file

use clap::{Parser, Subcommand};
use promptfleet::{Priority, RoutingStrategy};
use std::path::PathBuf;

/// Promptfleet - priority scheduling of prompt jobs across model channels
#[derive(Parser, Debug)]
#[command(name = "promptfleet")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Route a synthetic workload through the configured fleet
    Simulate(SimulateArgs),

    /// Print the effective configuration as YAML
    Config,

    /// List the pending tasks stored in a checkpoint file
    Checkpoint {
        /// Checkpoint file to read
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of prompts to enqueue
    #[arg(short = 'n', long, default_value_t = 20)]
    pub count: usize,

    /// Probability that an attempt fails (0.0 - 1.0)
    #[arg(long, default_value_t = 0.1)]
    pub fail_rate: f64,

    /// Mean handler latency in milliseconds
    #[arg(long, default_value_t = 50)]
    pub latency_ms: u64,

    /// Override the configured routing strategy
    #[arg(short, long)]
    pub strategy: Option<RoutingStrategy>,

    /// Priority for every prompt (urgent, high, normal, low, background)
    #[arg(short, long, default_value = "normal")]
    pub priority: Priority,

    /// Route by role instead of the default strategy
    #[arg(short, long)]
    pub role: Option<String>,

    /// Spread prompts round-robin across active channels regardless of load
    #[arg(long)]
    pub distributed: bool,

    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 120)]
    pub timeout_secs: u64,

    /// Also print fleet metrics as JSON
    #[arg(long)]
    pub json: bool,
}
