//! Command-line interface

use crate::quant::Backend;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Cuantizar: quantization of pruned convolutional classifiers
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "cuantizar")]
#[command(author = "PAIML")]
#[command(version)]
#[command(about = "Post-training static quantization and QAT of (pruned) CNN checkpoints")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Quantize a trained checkpoint
    Quantize(QuantizeArgs),

    /// Show the contents of a checkpoint or artifact
    Inspect(InspectArgs),
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct QuantizeArgs {
    /// Training configuration (YAML or JSON)
    #[arg(short, long, value_name = "CONFIG")]
    pub config: PathBuf,

    /// Trained checkpoint to quantize
    #[arg(long, value_name = "PATH")]
    pub checkpoint: PathBuf,

    /// Output directory for artifacts and QAT checkpoints
    #[arg(short, long, value_name = "DIR")]
    pub prefix: PathBuf,

    /// Post-training static quantization instead of QAT
    #[arg(long = "static")]
    pub static_mode: bool,

    /// Measure accuracy of the quantized and scripted models
    #[arg(long)]
    pub check_acc: bool,

    /// Kernel backend (fbgemm or qnnpack)
    #[arg(long, default_value = "fbgemm")]
    pub backend: Backend,

    /// Resume-info file for interrupted QAT
    #[arg(long, value_name = "PATH")]
    pub resume: Option<PathBuf>,

    /// Enable experiment tracking under this experiment name
    #[arg(long, value_name = "EXPERIMENT")]
    pub track: Option<String>,

    /// Directory for tracked runs (in-memory when omitted)
    #[arg(long, value_name = "DIR", requires = "track")]
    pub track_dir: Option<PathBuf>,

    /// Human-readable run name
    #[arg(long, value_name = "NAME", requires = "track")]
    pub run_name: Option<String>,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct InspectArgs {
    /// Checkpoint or artifact file
    #[arg(value_name = "FILE")]
    pub path: PathBuf,
}
