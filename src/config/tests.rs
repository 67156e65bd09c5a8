use super::*;
use crate::error::Error;
use crate::quant::Backend;
use clap::Parser;
use std::path::PathBuf;
use tempfile::TempDir;

const SIMPLENET_YAML: &str = r#"
SEED: 777
AUG_TRAIN: simple_augment_train_mnist
AUG_TEST: simple_augment_test_mnist
DATASET: SYNTHETIC
DATASET_PARAMS:
  num_classes: 4
MODEL_NAME: simplenet
MODEL_PARAMS:
  num_classes: 4
CRITERION: CrossEntropy
CRITERION_PARAMS:
  num_classes: 4
  label_smoothing: 0.1
LR_SCHEDULER: WarmupCosineLR
LR_SCHEDULER_PARAMS:
  warmup_epochs: 3
  start_lr: 0.001
BATCH_SIZE: 64
LR: 0.1
MOMENTUM: 0.9
WEIGHT_DECAY: 0.0001
NESTEROV: true
EPOCHS: 5
N_WORKERS: 8
PRUNE_METHOD: magnitude
"#;

#[test]
fn test_yaml_config_parses_upper_case_keys() {
    let config = TrainConfig::from_yaml_str(SIMPLENET_YAML).unwrap();
    assert_eq!(config.seed, 777);
    assert_eq!(config.model_name, "simplenet");
    assert_eq!(config.lr_scheduler, "WarmupCosineLR");
    assert_eq!(param_usize(&config.lr_scheduler_params, "warmup_epochs", 0).unwrap(), 3);
    assert_eq!(param_f64(&config.criterion_params, "label_smoothing", 0.0).unwrap(), 0.1);
    assert!(config.nesterov);
    assert_eq!(config.n_workers, Some(8));
    config.validate().unwrap();
}

#[test]
fn test_unknown_keys_are_preserved() {
    let config = TrainConfig::from_yaml_str(SIMPLENET_YAML).unwrap();
    assert_eq!(
        config.extra.get("PRUNE_METHOD").and_then(|v| v.as_str()),
        Some("magnitude")
    );
    let again = TrainConfig::from_yaml_str(&config.to_yaml().unwrap()).unwrap();
    assert_eq!(again, config);
}

#[test]
fn test_defaults_for_optional_keys() {
    let config = TrainConfig::from_json_str(
        r#"{"DATASET": "SYNTHETIC", "MODEL_NAME": "mlp", "BATCH_SIZE": 8, "LR": 0.01}"#,
    )
    .unwrap();
    assert_eq!(config.seed, 777);
    assert_eq!(config.criterion, "CrossEntropy");
    assert_eq!(config.lr_scheduler, "Constant");
    assert_eq!(config.epochs, 0);
    assert!(config.extra.is_empty());
}

#[test]
fn test_validation_rejects_bad_values() {
    let mut config = TrainConfig::new("SYNTHETIC", "mlp");
    config.batch_size = 0;
    assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

    let mut config = TrainConfig::new("SYNTHETIC", "mlp");
    config.lr = 0.0;
    assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

    let mut config = TrainConfig::new("SYNTHETIC", "mlp");
    config.nesterov = true;
    assert!(config.validate().is_err());
}

#[test]
fn test_load_picks_format_by_extension() {
    let dir = TempDir::new().unwrap();
    let yaml = dir.path().join("simplenet.yaml");
    std::fs::write(&yaml, SIMPLENET_YAML).unwrap();
    assert_eq!(TrainConfig::load(&yaml).unwrap().batch_size, 64);

    let json = dir.path().join("mlp.json");
    std::fs::write(
        &json,
        r#"{"DATASET": "SYNTHETIC", "MODEL_NAME": "mlp", "BATCH_SIZE": 0, "LR": 0.01}"#,
    )
    .unwrap();
    assert!(matches!(TrainConfig::load(&json), Err(Error::ConfigError(_))));
    assert!(TrainConfig::load(dir.path().join("absent.yaml")).is_err());
}

#[test]
fn test_param_type_errors() {
    let config = TrainConfig::from_yaml_str(SIMPLENET_YAML).unwrap();
    assert!(param_usize(&config.lr_scheduler_params, "start_lr", 0).is_err());
    assert_eq!(param_usize(&config.model_params, "width", 16).unwrap(), 16);
}

#[test]
fn test_cli_quantize_arguments() {
    let cli = Cli::try_parse_from([
        "cuantizar",
        "quantize",
        "--config",
        "simplenet.yaml",
        "--checkpoint",
        "save/prune/pruned.pth",
        "--prefix",
        "save/quant",
        "--static",
        "--backend",
        "qnnpack",
        "--track",
        "sweep",
    ])
    .unwrap();
    let Command::Quantize(args) = cli.command else {
        panic!("expected quantize");
    };
    assert!(args.static_mode);
    assert!(!args.check_acc);
    assert_eq!(args.backend, Backend::Qnnpack);
    assert_eq!(args.checkpoint, PathBuf::from("save/prune/pruned.pth"));
    assert_eq!(args.track.as_deref(), Some("sweep"));
}

#[test]
fn test_cli_defaults_and_inspect() {
    let cli = Cli::try_parse_from([
        "cuantizar", "quantize", "-c", "a.yaml", "--checkpoint", "b.pth", "-p", "out",
    ])
    .unwrap();
    let Command::Quantize(args) = cli.command else {
        panic!("expected quantize");
    };
    assert_eq!(args.backend, Backend::Fbgemm);
    assert!(!args.static_mode);

    let cli = Cli::try_parse_from(["cuantizar", "-v", "inspect", "out/orig_model.pth"]).unwrap();
    assert!(cli.verbose);
    assert!(matches!(cli.command, Command::Inspect(_)));
}

#[test]
fn test_cli_rejects_unknown_backend_and_orphan_track_dir() {
    assert!(Cli::try_parse_from([
        "cuantizar", "quantize", "-c", "a.yaml", "--checkpoint", "b.pth", "-p", "out",
        "--backend", "tpu",
    ])
    .is_err());
    assert!(Cli::try_parse_from([
        "cuantizar", "quantize", "-c", "a.yaml", "--checkpoint", "b.pth", "-p", "out",
        "--track-dir", "runs",
    ])
    .is_err());
}
