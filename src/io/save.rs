//! Saving state dicts as SafeTensors

use crate::error::{Error, Result};
use crate::nn::{StateDict, StateTensor};
use crate::quant::{QDtype, QScheme};
use safetensors::tensor::{Dtype, TensorView};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Metadata key holding qparams of quantized tensors
pub const QUANTIZATION_KEY: &str = "quantization";

/// Qparams stored alongside an integer tensor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantRecord {
    pub dtype: QDtype,
    pub scheme: QScheme,
}

/// Serialize a state dict with extra string metadata
///
/// Float tensors are stored as F32; quantized tensors as I8/U8 with their
/// qparams recorded under the `quantization` metadata entry.
pub fn encode_state_dict(dict: &StateDict, metadata: &BTreeMap<String, String>) -> Result<Vec<u8>> {
    let mut records: BTreeMap<&str, QuantRecord> = BTreeMap::new();
    let tensor_data: Vec<(&str, Dtype, Vec<usize>, Vec<u8>)> = dict
        .iter()
        .map(|(name, tensor)| match tensor {
            StateTensor::Float(t) => {
                let values: Vec<f32> = t.iter().copied().collect();
                let bytes = bytemuck::cast_slice(&values).to_vec();
                (name, Dtype::F32, t.shape().to_vec(), bytes)
            }
            StateTensor::Quantized(q) => {
                records.insert(
                    name,
                    QuantRecord {
                        dtype: q.dtype(),
                        scheme: q.scheme().clone(),
                    },
                );
                let dtype = match q.dtype() {
                    QDtype::QInt8 => Dtype::I8,
                    QDtype::QUInt8 => Dtype::U8,
                };
                (name, dtype, q.shape().to_vec(), q.to_bytes())
            }
        })
        .collect();

    let views = tensor_data
        .iter()
        .map(|(name, dtype, shape, bytes)| {
            TensorView::new(*dtype, shape.clone(), bytes)
                .map(|view| (*name, view))
                .map_err(|e| Error::Serialization(format!("tensor {name}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut st_metadata: HashMap<String, String> = metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !records.is_empty() {
        let json = serde_json::to_string(&records)
            .map_err(|e| Error::Serialization(format!("quantization metadata: {e}")))?;
        st_metadata.insert(QUANTIZATION_KEY.to_string(), json);
    }

    safetensors::serialize(views, Some(st_metadata))
        .map_err(|e| Error::Serialization(format!("SafeTensors serialization failed: {e}")))
}

/// Write a state dict to `path`, returning the number of bytes written
pub fn save_state_dict(
    path: impl AsRef<Path>,
    dict: &StateDict,
    metadata: &BTreeMap<String, String>,
) -> Result<u64> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = encode_state_dict(dict, metadata)?;
    std::fs::write(path, &bytes)?;
    Ok(bytes.len() as u64)
}

/// File size in megabytes (10^6 bytes)
pub fn file_size_mb(path: impl AsRef<Path>) -> Result<f64> {
    let len = std::fs::metadata(path.as_ref())?.len();
    Ok(len as f64 / 1e6)
}
