//! Quantization pipeline stages

use serde::{Deserialize, Serialize};

/// Boundary reached by the quantization pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Checkpoint loaded into the float model
    Initialized,
    /// Masks extracted and reparameterization removed
    MasksExtracted,
    /// Baseline artifact saved
    Baseline,
    /// Conv/BN/ReLU groups fused
    Fused,
    /// Observers or fake-quantizers attached
    Prepared,
    /// Pruning masks re-applied to the fused graph
    MasksReinstalled,
    /// Static observers calibrated
    Calibrated,
    /// Quantization-aware training finished
    Trained,
    /// Observers disabled and BatchNorm statistics frozen
    ObserversFrozen,
    /// Best QAT checkpoint reloaded
    Resumed,
    /// Integer model converted and saved
    Quantized,
    /// Scripted program compiled and saved
    Scripted,
}

impl Stage {
    pub fn display_name(&self) -> &'static str {
        match self {
            Stage::Initialized => "Initialized",
            Stage::MasksExtracted => "Masks Extracted",
            Stage::Baseline => "Baseline",
            Stage::Fused => "Fused",
            Stage::Prepared => "Prepared",
            Stage::MasksReinstalled => "Masks Reinstalled",
            Stage::Calibrated => "Calibrated",
            Stage::Trained => "Trained",
            Stage::ObserversFrozen => "Observers Frozen",
            Stage::Resumed => "Resumed",
            Stage::Quantized => "Quantized",
            Stage::Scripted => "Scripted",
        }
    }
}

/// Ordered record of reached stages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTrace {
    stages: Vec<Stage>,
}

impl StageTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    /// Whether `first` was reached before `second`
    pub fn precedes(&self, first: Stage, second: Stage) -> bool {
        let pos = |s| self.stages.iter().position(|&x| x == s);
        matches!((pos(first), pos(second)), (Some(a), Some(b)) if a < b)
    }

    pub fn last(&self) -> Option<Stage> {
        self.stages.last().copied()
    }
}
