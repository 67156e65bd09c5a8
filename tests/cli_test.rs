//! Command-line entry points driven through `run_command`

use clap::Parser;
use cuantizar::cli::{run_command, Cli};
use cuantizar::config::TrainConfig;
use cuantizar::io::Checkpoint;
use cuantizar::models::build_model;
use tempfile::TempDir;

const CONFIG: &str = r#"{
  "DATASET": "SYNTHETIC",
  "DATASET_PARAMS": {"num_classes": 2, "image_size": 4, "train_size": 8, "test_size": 4},
  "MODEL_NAME": "mlp",
  "MODEL_PARAMS": {"in_features": 16, "hidden": 4, "num_classes": 2},
  "BATCH_SIZE": 4,
  "LR": 0.1,
  "EPOCHS": 1
}"#;

fn setup(dir: &TempDir) -> (String, String) {
    let config_path = dir.path().join("config.json");
    std::fs::write(&config_path, CONFIG).expect("write config");
    let config = TrainConfig::from_json_str(CONFIG).expect("parse config");
    let model = build_model(&config.model_name, &config.model_params, 0).expect("build");
    let checkpoint = dir.path().join("best.pth");
    Checkpoint::new(model.state_dict(), 55.5)
        .save(&checkpoint)
        .expect("save");
    (
        config_path.display().to_string(),
        checkpoint.display().to_string(),
    )
}

#[test]
fn test_quantize_then_inspect() {
    let dir = TempDir::new().expect("temp dir");
    let (config, checkpoint) = setup(&dir);
    let prefix = dir.path().join("out");
    let prefix_arg = prefix.display().to_string();
    let cli = Cli::try_parse_from([
        "cuantizar", "-q", "quantize", "-c", &config, "--checkpoint", &checkpoint, "-p",
        &prefix_arg, "--static", "--check-acc", "--backend", "qnnpack",
    ])
    .expect("arguments should parse");
    run_command(cli).expect("quantize should succeed");
    assert!(prefix.join("scripted_model.pth").exists());

    let scripted = prefix.join("scripted_model.pth").display().to_string();
    let cli = Cli::try_parse_from(["cuantizar", "--quiet", "inspect", &scripted])
        .expect("arguments should parse");
    run_command(cli).expect("inspect should succeed");
}

#[test]
fn test_qat_through_the_cli_writes_checkpoints() {
    let dir = TempDir::new().expect("temp dir");
    let (config, checkpoint) = setup(&dir);
    let prefix = dir.path().join("out");
    let prefix_arg = prefix.display().to_string();
    let cli = Cli::try_parse_from([
        "cuantizar", "-q", "quantize", "-c", &config, "--checkpoint", &checkpoint, "-p",
        &prefix_arg,
    ])
    .expect("arguments should parse");
    run_command(cli).expect("qat should succeed");
    assert!(prefix.join("qat").join("best.pth").exists());
    assert!(prefix.join("qat").join("last.pth").exists());
}

#[test]
fn test_errors_are_reported_as_messages() {
    let dir = TempDir::new().expect("temp dir");
    let (config, _) = setup(&dir);
    let missing = dir.path().join("missing.pth").display().to_string();
    let cli = Cli::try_parse_from([
        "cuantizar", "-q", "quantize", "-c", &config, "--checkpoint", &missing, "-p", "out",
    ])
    .expect("arguments should parse");
    let err = run_command(cli).expect_err("missing checkpoint must fail");
    assert!(err.contains("Checkpoint not found"), "{err}");

    let cli = Cli::try_parse_from(["cuantizar", "inspect", &missing]).expect("parse");
    assert!(run_command(cli).is_err());
}
