//! Inspect command implementation

use crate::config::InspectArgs;
use crate::io::{load_state_dict, EPOCH_KEY, TEST_ACC_KEY};
use crate::logging::{ConsoleSink, LogLevel, LogSink};
use crate::script::{ScriptedModel, PROGRAM_KEY};
use std::path::Path;

/// Summary lines for a checkpoint, an artifact or a scripted model
pub(super) fn inspect_lines(path: &Path, sink: &dyn LogSink) -> Result<(), String> {
    let loaded = load_state_dict(path).map_err(|e| e.to_string())?;
    let file_size = std::fs::metadata(path)
        .map_err(|e| format!("Failed to read file: {e}"))?
        .len();
    let params: usize = loaded
        .state_dict
        .iter()
        .map(|(_, t)| t.shape().iter().product::<usize>())
        .sum();

    sink.info("Model Information:");
    sink.info(&format!("  File size: {:.6} MB", file_size as f64 / 1e6));
    sink.info(&format!("  Tensors: {}", loaded.state_dict.len()));
    sink.info(&format!("  Elements: {params}"));
    let masks = loaded.state_dict.mask_keys().len();
    if masks > 0 {
        sink.info(&format!("  Pruning masks: {masks}"));
    }
    if let Some(acc) = loaded.metadata.get(TEST_ACC_KEY) {
        sink.info(&format!("  Test accuracy: {acc} %"));
    }
    if let Some(epoch) = loaded.metadata.get(EPOCH_KEY) {
        sink.info(&format!("  Epoch: {epoch}"));
    }

    if loaded.metadata.contains_key(PROGRAM_KEY) {
        let scripted = ScriptedModel::load(path).map_err(|e| e.to_string())?;
        sink.info(&format!("  Program ops: {}", scripted.program().len()));
        scripted.describe(sink);
    } else {
        for (key, tensor) in loaded.state_dict.iter() {
            sink.debug(&format!("  {key}: {} {:?}", tensor.dtype_name(), tensor.shape()));
        }
    }
    Ok(())
}

pub fn run_inspect(args: InspectArgs, level: LogLevel) -> Result<(), String> {
    if !args.path.exists() {
        return Err(format!("File not found: {}", args.path.display()));
    }
    inspect_lines(&args.path, &ConsoleSink::new(level))
}
