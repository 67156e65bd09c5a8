//! Training configuration mapping

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Free-form `*_PARAMS` sub-mapping
pub type Params = Map<String, Value>;

fn default_seed() -> u64 {
    777
}

fn default_criterion() -> String {
    "CrossEntropy".to_string()
}

fn default_scheduler() -> String {
    "Constant".to_string()
}

/// Configuration forwarded to the trainer
///
/// Keys use the upper-case names of the training configs. Keys the crate
/// does not interpret are kept in `extra` and written back on save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TrainConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Accepted and ignored
    #[serde(default)]
    pub aug_train: Option<String>,
    /// Accepted and ignored
    #[serde(default)]
    pub aug_test: Option<String>,
    pub dataset: String,
    #[serde(default)]
    pub dataset_params: Params,
    /// Directory holding `<DATASET>/{train,test}.safetensors`
    #[serde(default)]
    pub data_root: Option<PathBuf>,
    pub model_name: String,
    #[serde(default)]
    pub model_params: Params,
    #[serde(default = "default_criterion")]
    pub criterion: String,
    #[serde(default)]
    pub criterion_params: Params,
    #[serde(default = "default_scheduler")]
    pub lr_scheduler: String,
    #[serde(default)]
    pub lr_scheduler_params: Params,
    pub batch_size: usize,
    pub lr: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub nesterov: bool,
    #[serde(default)]
    pub epochs: usize,
    /// Accepted and ignored; loading is single-threaded
    #[serde(default)]
    pub n_workers: Option<usize>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TrainConfig {
    /// Minimal config with defaults for every optional key
    pub fn new(dataset: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            seed: default_seed(),
            aug_train: None,
            aug_test: None,
            dataset: dataset.into(),
            dataset_params: Params::new(),
            data_root: None,
            model_name: model_name.into(),
            model_params: Params::new(),
            criterion: default_criterion(),
            criterion_params: Params::new(),
            lr_scheduler: default_scheduler(),
            lr_scheduler_params: Params::new(),
            batch_size: 32,
            lr: 0.1,
            momentum: 0.0,
            weight_decay: 0.0,
            nesterov: false,
            epochs: 1,
            n_workers: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {e}")))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::ConfigError(format!("Failed to parse JSON config: {e}")))
    }

    /// Read and validate a `.json`, `.yaml` or `.yml` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_yaml_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::ConfigError("BATCH_SIZE must be positive".into()));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(Error::ConfigError(format!(
                "LR must be a positive number, got {}",
                self.lr
            )));
        }
        if self.momentum < 0.0 || self.weight_decay < 0.0 {
            return Err(Error::ConfigError(
                "MOMENTUM and WEIGHT_DECAY must be non-negative".into(),
            ));
        }
        if self.nesterov && self.momentum == 0.0 {
            return Err(Error::ConfigError("NESTEROV requires MOMENTUM > 0".into()));
        }
        Ok(())
    }
}

/// Typed lookup in a `*_PARAMS` mapping
pub fn param_usize(params: &Params, key: &str, default: usize) -> Result<usize> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| Error::ConfigError(format!("{key} must be a non-negative integer, got {v}"))),
    }
}

/// Typed lookup in a `*_PARAMS` mapping
pub fn param_f64(params: &Params, key: &str, default: f64) -> Result<f64> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| Error::ConfigError(format!("{key} must be a number, got {v}"))),
    }
}
