//! Configuration: the training mapping and the command line

mod cli;
mod train_config;

#[cfg(test)]
mod tests;

pub use cli::{Cli, Command, InspectArgs, QuantizeArgs};
pub use train_config::{param_f64, param_usize, Params, TrainConfig};
