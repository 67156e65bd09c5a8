//! CLI command implementations

mod inspect;
mod quantize;

#[cfg(test)]
mod tests;

use crate::config::{Cli, Command};
use crate::logging::LogLevel;

/// Execute a CLI command based on the parsed arguments
pub fn run_command(cli: Cli) -> Result<(), String> {
    let log_level = if cli.quiet {
        LogLevel::Quiet
    } else if cli.verbose {
        LogLevel::Verbose
    } else {
        LogLevel::Normal
    };

    match cli.command {
        Command::Quantize(args) => quantize::run_quantize(args, log_level),
        Command::Inspect(args) => inspect::run_inspect(args, log_level),
    }
}
