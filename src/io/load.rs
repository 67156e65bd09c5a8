//! Loading state dicts from SafeTensors

use super::save::{QuantRecord, QUANTIZATION_KEY};
use crate::error::{Error, Result};
use crate::nn::{StateDict, StateTensor};
use crate::quant::QTensor;
use crate::Tensor;
use ndarray::IxDyn;
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Decoded file: tensors plus string metadata (the `quantization` entry
/// is consumed)
#[derive(Clone, Debug, Default)]
pub struct LoadedFile {
    pub state_dict: StateDict,
    pub metadata: HashMap<String, String>,
}

/// f32 values from raw tensor bytes
///
/// SafeTensors data is not guaranteed to be aligned, so the bytes are copied
/// rather than cast in place.
pub fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytemuck::pod_collect_to_vec(bytes)
}

/// i64 values from raw tensor bytes
pub fn i64_values(bytes: &[u8]) -> Vec<i64> {
    bytemuck::pod_collect_to_vec(bytes)
}

/// Float tensor from raw F32 bytes
pub fn float_tensor(name: &str, shape: &[usize], bytes: &[u8]) -> Result<Tensor> {
    Tensor::from_shape_vec(IxDyn(shape), f32_values(bytes))
        .map_err(|e| Error::Serialization(format!("tensor {name}: {e}")))
}

/// Decode bytes produced by [`encode_state_dict`](super::encode_state_dict)
pub fn decode_state_dict(data: &[u8]) -> Result<LoadedFile> {
    let (_, header) = SafeTensors::read_metadata(data)
        .map_err(|e| Error::Serialization(format!("SafeTensors parsing failed: {e}")))?;
    let mut metadata = header.metadata().clone().unwrap_or_default();
    let records: BTreeMap<String, QuantRecord> = match metadata.remove(QUANTIZATION_KEY) {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| Error::Serialization(format!("quantization metadata: {e}")))?,
        None => BTreeMap::new(),
    };

    let tensors = SafeTensors::deserialize(data)
        .map_err(|e| Error::Serialization(format!("SafeTensors parsing failed: {e}")))?;
    let mut state_dict = StateDict::new();
    for (name, view) in tensors.tensors() {
        let tensor: StateTensor = match view.dtype() {
            Dtype::F32 => float_tensor(&name, view.shape(), view.data())?.into(),
            Dtype::I8 | Dtype::U8 => {
                let record = records.get(&name).ok_or_else(|| {
                    Error::Serialization(format!("tensor {name}: missing qparams"))
                })?;
                QTensor::from_bytes(record.dtype, view.shape(), view.data(), record.scheme.clone())?
                    .into()
            }
            other => {
                return Err(Error::Serialization(format!(
                    "tensor {name}: unsupported dtype {other:?}"
                )))
            }
        };
        state_dict.insert(name, tensor);
    }
    Ok(LoadedFile {
        state_dict,
        metadata,
    })
}

/// Read and decode a SafeTensors state dict file
pub fn load_state_dict(path: impl AsRef<Path>) -> Result<LoadedFile> {
    let data = std::fs::read(path.as_ref())?;
    decode_state_dict(&data)
}
