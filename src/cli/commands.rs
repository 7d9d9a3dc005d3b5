//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - limits: inspect and override provider limits
//! - learned: inspect and adjust learned concurrency limits
//! - checkpoints: inspect and purge task checkpoints
//! - estimate: show the cost estimate for a task source

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Gatekeeper - admission control for rate-limited agent work
#[derive(Parser, Debug)]
#[command(name = "gatekeeper")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

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
    /// Provider limit registry
    Limits {
        #[command(subcommand)]
        command: LimitsCommands,
    },

    /// Learned concurrency limits
    Learned {
        #[command(subcommand)]
        command: LearnedCommands,
    },

    /// Task checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },

    /// Show the cost estimate for a task source
    Estimate {
        /// Task source (subagent, team, parallel-subagent, parallel-team)
        source: String,

        /// Provider the task will call
        #[arg(short, long)]
        provider: Option<String>,

        /// Model the task will call
        #[arg(short, long)]
        model: Option<String>,

        /// Task description, used to scale the estimate
        #[arg(short, long)]
        description: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum LimitsCommands {
    /// Resolve the limit for a provider/model
    Resolve {
        provider: String,
        model: String,

        /// Account tier (e.g. tier1, tier4)
        #[arg(short, long)]
        tier: Option<String>,
    },

    /// List the merged preset and override table
    Show {
        /// Only show this provider
        #[arg(short, long)]
        provider: Option<String>,
    },

    /// Write a user override
    Set {
        provider: String,

        /// Model glob pattern; omit to set the provider default
        #[arg(short = 'P', long)]
        pattern: Option<String>,

        /// Tier the override applies to
        #[arg(short, long)]
        tier: Option<String>,

        /// Requests per minute
        #[arg(long)]
        rpm: u32,

        /// Maximum concurrent tasks
        #[arg(long)]
        concurrency: u32,
    },

    /// Re-read the override file
    Reload,
}

#[derive(Subcommand, Debug, Clone)]
pub enum LearnedCommands {
    /// List learned limits
    Show,

    /// Forget the learned limit for a provider/model
    Reset { provider: String, model: String },

    /// Set the fleet-wide multiplier, clamped to [0.1, 1.0]
    Multiplier { value: f64 },

    /// Run due recoveries now
    Recover,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CheckpointCommands {
    /// List stored checkpoints
    List {
        /// Only list expired checkpoints
        #[arg(short, long)]
        expired: bool,
    },

    /// Show a task's checkpoint
    Show { task_id: String },

    /// Delete a task's checkpoint
    Delete { task_id: String },

    /// Purge expired checkpoints
    Cleanup,
}
