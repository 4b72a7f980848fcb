//! CLI module for the converge tool.
//!
//! This module provides the command-line interface for planning, promoting
//! and reconciling cluster environments.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
