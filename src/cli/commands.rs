//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Converge - Staged cluster lifecycle reconciliation.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text", env = "CONVERGE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new platform project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the platform configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the plan for one environment.
    Plan {
        /// Environment identifier.
        environment: String,

        /// Show changed fields for each resource.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Converge one environment directly, outside a promotion run.
    Apply {
        /// Environment identifier.
        environment: String,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Start a promotion run through every environment in order.
    Promote,

    /// Approve the environment a run is waiting on.
    Approve {
        /// Run identifier or unique prefix.
        run: String,

        /// Environment being approved (defaults to the one the run waits on).
        #[arg(short, long)]
        environment: Option<String>,
    },

    /// Reject the environment a run is waiting on.
    Reject {
        /// Run identifier or unique prefix.
        run: String,

        /// Environment being rejected (defaults to the one the run waits on).
        #[arg(short, long)]
        environment: Option<String>,

        /// Why the promotion is rejected.
        #[arg(short, long, default_value = "rejected by operator")]
        reason: String,
    },

    /// Cancel a run.
    Cancel {
        /// Run identifier or unique prefix.
        run: String,

        /// Why the run is cancelled.
        #[arg(short, long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Show environments and runs, or one run in detail.
    Status {
        /// Run identifier or unique prefix.
        run: Option<String>,
    },

    /// Reconcile cluster add-ons against their declared versions.
    ReconcileAddons {
        /// Only reconcile clusters in this environment.
        #[arg(short, long)]
        environment: Option<String>,

        /// Run a single cycle per cluster and exit.
        #[arg(long)]
        once: bool,

        /// Seconds between cycles (defaults to the configured interval).
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Check for drift between configuration and observed state.
    Drift {
        /// Environment identifier.
        environment: String,
    },

    /// Manage state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,

        /// What the lock is held for.
        #[arg(long, default_value = "manual")]
        purpose: String,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_approve() {
        let cli = Cli::try_parse_from(["converge", "approve", "3f2a", "--environment", "prod"]).unwrap();
        match cli.command {
            Commands::Approve { run, environment } => {
                assert_eq!(run, "3f2a");
                assert_eq!(environment.as_deref(), Some("prod"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_reconcile_addons() {
        let cli = Cli::try_parse_from([
            "converge",
            "--output",
            "json",
            "reconcile-addons",
            "--once",
            "-e",
            "dev",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::ReconcileAddons { once: true, environment: Some(ref e), interval: None } if e == "dev"
        ));
    }

    #[test]
    fn test_plan_requires_environment() {
        assert!(Cli::try_parse_from(["converge", "plan"]).is_err());
    }
}
