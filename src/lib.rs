//! Cuantizar: quantization of trained, optionally pruned, CNN classifiers
//!
//! Takes a float checkpoint through fusion, observer insertion, calibration
//! or quantization-aware training, integer conversion and scripting:
//! - `nn`: module trees, forward passes and conv/bn/relu fusion
//! - `quant`: observers, fake quantization, conversion and integer kernels
//! - `prune`: mask reparameterization and mask reconciliation across fusion
//! - `train`: classifier-head training with checkpointing and a pre-test hook
//! - `quantizer`: the end-to-end pipeline
//! - `script`: self-contained op programs
//! - `profile`: per-operator inference timing
//!
//! # Example
//!
//! ```no_run
//! use cuantizar::config::TrainConfig;
//! use cuantizar::logging::{ConsoleSink, LogLevel};
//! use cuantizar::quantizer::{QuantMode, Quantizer, QuantizerOptions};
//! use std::sync::Arc;
//!
//! let config = TrainConfig::load("config/simplenet.yaml")?;
//! let options = QuantizerOptions::new("save/best.pth", "save/quant").with_mode(QuantMode::Static);
//! let mut quantizer = Quantizer::new(config, options, Arc::new(ConsoleSink::new(LogLevel::Normal)))?;
//! let report = quantizer.run(None)?;
//! println!("{:.6} MB", report.quantized.size_mb);
//! # Ok::<(), cuantizar::Error>(())
//! ```

pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod io;
pub mod logging;
pub mod models;
pub mod nn;
pub mod optim;
pub mod profile;
pub mod prune;
pub mod quant;
pub mod quantizer;
pub mod script;
pub mod tracking;
pub mod train;

/// Dense float tensor used throughout the crate
pub type Tensor = ndarray::ArrayD<f32>;

pub use error::{Error, Result};
pub use quantizer::{QuantMode, QuantizationReport, Quantizer, QuantizerOptions};
