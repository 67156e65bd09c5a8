//! Model persistence
//!
//! Checkpoints and artifacts are SafeTensors files. Float tensors are F32;
//! quantized tensors are I8/U8 with qparams kept as JSON metadata.

mod checkpoint;
mod load;
mod save;


pub use checkpoint::{Checkpoint, EPOCH_KEY, TEST_ACC_KEY};
pub use load::{decode_state_dict, f32_values, float_tensor, i64_values, load_state_dict, LoadedFile};
pub use save::{
    encode_state_dict, file_size_mb, save_state_dict, QuantRecord, QUANTIZATION_KEY,
};
