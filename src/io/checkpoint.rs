//! Training checkpoints: state dict plus recorded accuracy

use super::load::load_state_dict;
use super::save::save_state_dict;
use crate::error::{Error, Result};
use crate::nn::StateDict;
use std::collections::BTreeMap;
use std::path::Path;

/// Metadata key of the recorded test accuracy
pub const TEST_ACC_KEY: &str = "test_acc";
/// Metadata key of the epoch the checkpoint was taken at
pub const EPOCH_KEY: &str = "epoch";

/// Persisted training record
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub state_dict: StateDict,
    /// Test accuracy in percent
    pub test_acc: f64,
    pub epoch: Option<usize>,
}

impl Checkpoint {
    pub fn new(state_dict: StateDict, test_acc: f64) -> Self {
        Self {
            state_dict,
            test_acc,
            epoch: None,
        }
    }

    pub fn with_epoch(mut self, epoch: usize) -> Self {
        self.epoch = Some(epoch);
        self
    }

    /// Whether the checkpoint comes from a pruning run
    pub fn is_pruned(&self) -> bool {
        self.state_dict.has_masks()
    }

    /// Load a checkpoint, requiring the `test_acc` entry
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::CheckpointNotFound(path.to_path_buf()));
        }
        let loaded = load_state_dict(path)?;
        let test_acc = loaded
            .metadata
            .get(TEST_ACC_KEY)
            .ok_or_else(|| Error::MissingCheckpointEntry {
                path: path.to_path_buf(),
                key: TEST_ACC_KEY.to_string(),
            })?
            .parse::<f64>()
            .map_err(|e| Error::Serialization(format!("{TEST_ACC_KEY}: {e}")))?;
        let epoch = loaded
            .metadata
            .get(EPOCH_KEY)
            .map(|e| e.parse::<usize>())
            .transpose()
            .map_err(|e| Error::Serialization(format!("{EPOCH_KEY}: {e}")))?;
        Ok(Self {
            state_dict: loaded.state_dict,
            test_acc,
            epoch,
        })
    }

    /// Save the checkpoint, returning the number of bytes written
    pub fn save(&self, path: impl AsRef<Path>) -> Result<u64> {
        let mut metadata = BTreeMap::new();
        metadata.insert(TEST_ACC_KEY.to_string(), format!("{:?}", self.test_acc));
        if let Some(epoch) = self.epoch {
            metadata.insert(EPOCH_KEY.to_string(), epoch.to_string());
        }
        save_state_dict(path, &self.state_dict, &metadata)
    }
}
