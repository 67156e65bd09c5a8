use super::inspect::inspect_lines;
use super::quantize::quantizer_options;
use crate::config::{Cli, Command};
use crate::io::Checkpoint;
use crate::logging::MemorySink;
use crate::nn::StateDict;
use crate::quant::Backend;
use crate::quantizer::QuantMode;
use crate::Tensor;
use clap::Parser;
use ndarray::IxDyn;
use tempfile::TempDir;

fn quantize_args(extra: &[&str]) -> crate::config::QuantizeArgs {
    let mut argv = vec![
        "cuantizar", "quantize", "-c", "cfg.yaml", "--checkpoint", "best.pth", "-p", "out",
    ];
    argv.extend_from_slice(extra);
    match Cli::try_parse_from(argv).unwrap().command {
        Command::Quantize(args) => args,
        other => panic!("unexpected command {other:?}"),
    }
}

#[test]
fn test_default_options_select_qat_on_fbgemm() {
    let options = quantizer_options(&quantize_args(&[]));
    assert_eq!(options.mode, QuantMode::Qat);
    assert_eq!(options.backend, Backend::Fbgemm);
    assert!(!options.check_acc);
    assert!(options.tracking.is_none());
}

#[test]
fn test_flags_map_onto_options() {
    let args = quantize_args(&[
        "--static", "--check-acc", "--backend", "qnnpack", "--track", "exp", "--track-dir",
        "runs", "--run-name", "first",
    ]);
    let options = quantizer_options(&args);
    assert_eq!(options.mode, QuantMode::Static);
    assert_eq!(options.backend, Backend::Qnnpack);
    assert!(options.check_acc);
    let tracking = options.tracking.unwrap();
    assert_eq!(tracking.experiment, "exp");
    assert_eq!(tracking.run_name.as_deref(), Some("first"));
    assert_eq!(tracking.dir, Some("runs".into()));
}

#[test]
fn test_track_dir_requires_track() {
    let argv = [
        "cuantizar", "quantize", "-c", "c", "--checkpoint", "b", "-p", "o", "--track-dir", "runs",
    ];
    assert!(Cli::try_parse_from(argv).is_err());
}

#[test]
fn test_inspect_reports_checkpoint_entries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("best.pth");
    let mut dict = StateDict::new();
    dict.insert("fc.weight_orig", Tensor::zeros(IxDyn(&[2, 3])));
    dict.insert("fc.weight_mask", Tensor::ones(IxDyn(&[2, 3])));
    Checkpoint::new(dict, 71.0).with_epoch(4).save(&path).unwrap();

    let sink = MemorySink::new().with_debug();
    inspect_lines(&path, &sink).unwrap();
    assert_eq!(sink.matching("Tensors: 2").len(), 1);
    assert_eq!(sink.matching("Elements: 12").len(), 1);
    assert_eq!(sink.matching("Pruning masks: 1").len(), 1);
    assert_eq!(sink.matching("Test accuracy: 71.0 %").len(), 1);
    assert_eq!(sink.matching("Epoch: 4").len(), 1);
    assert_eq!(sink.matching("fc.weight_mask: float32 [2, 3]").len(), 1);
}
