//! Cuantizar CLI
//!
//! # Usage
//!
//! ```bash
//! # Quantization-aware training of a pruned checkpoint
//! cuantizar quantize -c config.yaml --checkpoint save/best.pth -p save/quant
//!
//! # Post-training static quantization with accuracy checks
//! cuantizar quantize -c config.yaml --checkpoint save/best.pth -p save/quant --static --check-acc
//!
//! # Show a checkpoint or artifact
//! cuantizar inspect save/quant/quantized_model.pth
//! ```

use clap::Parser;
use cuantizar::cli::{run_command, Cli};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
