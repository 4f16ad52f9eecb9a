//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Undercity - autonomous code-modification orchestrator
#[derive(Parser)]
#[command(
    name = "uc",
    about = "Autonomous code-modification orchestrator",
    version,
    after_help = "State lives in .undercity/ next to the repository root"
)]
pub struct Cli {
    /// Path to config file (defaults to .undercityrc)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Work the task board (or a single goal)
    Grind {
        /// Single goal to run as one task; drains the board when omitted
        goal: Option<String>,

        /// Stop after this many tasks
        #[arg(short = 'n', long = "count")]
        count: Option<u32>,

        /// Parallel workers (1..=5)
        #[arg(short = 'p', long = "parallel")]
        parallel: Option<u32>,

        /// Pause for confirmation between tasks
        #[arg(long)]
        supervised: bool,

        /// Model tier override (haiku/sonnet/opus)
        #[arg(short = 'm', long = "model")]
        model: Option<String>,

        /// Run as a single worker (no orchestration)
        #[arg(long)]
        worker: bool,

        /// Skip branches, commits, and pushes
        #[arg(long = "no-commit")]
        no_commit: bool,

        /// Skip the typecheck half of verification
        #[arg(long = "no-typecheck")]
        no_typecheck: bool,

        /// Force review passes on
        #[arg(long)]
        review: bool,
    },

    /// Usage snapshot
    Limits,

    /// Live board view (plain polling)
    Watch,

    /// Run the control daemon
    Serve {
        /// Port to listen on
        #[arg(short = 'p', long)]
        port: Option<u16>,

        /// Also grind the board while serving
        #[arg(long)]
        grind: bool,
    },

    /// Control a running daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// Recent events / summary
    Status {
        /// Human-readable summary
        #[arg(long)]
        human: bool,

        /// Raw event listing
        #[arg(long)]
        events: bool,

        /// Number of entries
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,
    },

    /// Permanent-failure report
    Postmortem {
        #[arg(long)]
        json: bool,
    },

    /// Learnings report
    Insights {
        #[arg(long)]
        json: bool,

        /// Only learnings created since this ISO date
        #[arg(long)]
        since: Option<String>,

        /// Only the N most confident
        #[arg(long)]
        last: Option<usize>,
    },

    /// Error-pattern report
    Patterns,

    /// Decision tracker
    Decisions {
        /// Only pending decisions
        #[arg(long)]
        pending: bool,

        /// Interactively resolve pending decisions
        #[arg(long)]
        process: bool,
    },

    /// Per-tier success rates
    Effectiveness,

    /// Session reports
    Visualize {
        /// List available sessions
        #[arg(long)]
        list: bool,

        /// Session (batch) id
        #[arg(short = 's', long)]
        session: Option<String>,

        /// Open the latest report
        #[arg(long)]
        open: bool,
    },

    /// Initialise the state directory
    Init {
        /// State directory location
        #[arg(short = 'd', long)]
        dir: Option<PathBuf>,
    },

    /// Validate the environment and write a starter config
    Setup,

    /// Show or initialise the configuration
    Config {
        /// Write the default .undercityrc
        #[arg(long)]
        init: bool,
    },

    /// Ask the knowledge base what it would do
    Oracle {
        /// The situation to ask about
        situation: Option<String>,
    },
}

/// Daemon control actions
#[derive(Subcommand)]
pub enum DaemonAction {
    /// Show daemon status
    Status,
    /// Stop the daemon
    Stop,
    /// Pause dispatching
    Pause,
    /// Resume dispatching
    Resume,
}
