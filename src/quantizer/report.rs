//! Artifact reports

use crate::profile::InferenceProfile;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Output file of the float baseline
pub const ORIG_MODEL: &str = "orig_model.pth";
/// Output file of the converted model
pub const QUANTIZED_MODEL: &str = "quantized_model.pth";
/// Output file of the scripted program
pub const SCRIPTED_MODEL: &str = "scripted_model.pth";

/// A saved model file with its size and, when measured, its accuracy and
/// inference timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactReport {
    pub path: PathBuf,
    pub size_mb: f64,
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference: Option<InferenceProfile>,
}

impl ArtifactReport {
    /// `Acc: <acc> %\tSize: <size> MB`, with `None` for an unmeasured
    /// accuracy
    pub fn log_line(&self) -> String {
        let acc = self
            .accuracy
            .map_or_else(|| "None".to_string(), |a| format!("{a:.2}"));
        format!("Acc: {acc} %\tSize: {:.6} MB", self.size_mb)
    }

    /// Whole-evaluation inference time, when profiled
    pub fn inference_ms(&self) -> Option<f64> {
        self.inference.as_ref().map(|p| p.total_ms)
    }
}

/// The three artifacts of one quantization run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationReport {
    pub original: ArtifactReport,
    pub quantized: ArtifactReport,
    pub scripted: ArtifactReport,
}

impl QuantizationReport {
    /// Size of the float baseline over the size of the quantized model
    pub fn compression_ratio(&self) -> f64 {
        if self.quantized.size_mb > 0.0 {
            self.original.size_mb / self.quantized.size_mb
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_formats() {
        let mut report = ArtifactReport {
            path: PathBuf::from(QUANTIZED_MODEL),
            size_mb: 0.0025,
            accuracy: None,
            inference: None,
        };
        assert_eq!(report.log_line(), "Acc: None %\tSize: 0.002500 MB");
        report.accuracy = Some(70.126);
        assert_eq!(report.log_line(), "Acc: 70.13 %\tSize: 0.002500 MB");
        assert_eq!(report.inference_ms(), None);
    }

    #[test]
    fn test_unprofiled_report_omits_inference() {
        let report = ArtifactReport {
            path: PathBuf::from(ORIG_MODEL),
            size_mb: 1.0,
            accuracy: Some(71.0),
            inference: None,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("inference"));
        let back: ArtifactReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
