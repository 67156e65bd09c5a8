//! Quantize command implementation

use crate::config::{QuantizeArgs, TrainConfig};
use crate::logging::{ConsoleSink, LogLevel, LogSink};
use crate::quantizer::{QuantMode, Quantizer, QuantizerOptions};
use crate::tracking::TrackingParams;
use std::sync::Arc;

/// Options for the quantizer from the parsed arguments
pub(super) fn quantizer_options(args: &QuantizeArgs) -> QuantizerOptions {
    let mode = if args.static_mode {
        QuantMode::Static
    } else {
        QuantMode::Qat
    };
    let mut options = QuantizerOptions::new(&args.checkpoint, &args.prefix)
        .with_mode(mode)
        .with_check_acc(args.check_acc)
        .with_backend(args.backend);
    if let Some(experiment) = &args.track {
        let mut params = TrackingParams::new(experiment);
        if let Some(dir) = &args.track_dir {
            params = params.with_dir(dir);
        }
        if let Some(name) = &args.run_name {
            params = params.with_run_name(name);
        }
        options = options.with_tracking(params);
    }
    options
}

pub fn run_quantize(args: QuantizeArgs, level: LogLevel) -> Result<(), String> {
    let sink = ConsoleSink::new(level);
    sink.debug(&format!("Config: {}", args.config.display()));
    let config = TrainConfig::load(&args.config).map_err(|e| e.to_string())?;
    let options = quantizer_options(&args);

    let mut quantizer =
        Quantizer::new(config, options, Arc::new(sink)).map_err(|e| e.to_string())?;
    let report = quantizer
        .run(args.resume.as_deref())
        .map_err(|e| e.to_string())?;

    sink.info(&format!(
        "Saved {}, {} and {}",
        report.original.path.display(),
        report.quantized.path.display(),
        report.scripted.path.display()
    ));
    sink.debug(&format!(
        "Compression ratio: {:.2}x",
        report.compression_ratio()
    ));
    Ok(())
}
