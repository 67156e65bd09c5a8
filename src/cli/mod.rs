//! CLI module for cuantizar
//!
//! Command handlers print through a [`ConsoleSink`](crate::logging::ConsoleSink)
//! at the level selected by `--verbose`/`--quiet`.

mod commands;

pub use commands::run_command;

pub use crate::config::Cli;
pub use crate::logging::LogLevel;
