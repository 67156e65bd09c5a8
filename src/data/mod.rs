//! Datasets and batch loading
//!
//! Datasets come from `<DATA_ROOT>/<DATASET>/{train,test}.safetensors` or are
//! generated when `DATASET` is `SYNTHETIC`.

mod dataset;
mod loader;

#[cfg(test)]
mod tests;

pub use dataset::{split_path, Dataset, Split, SyntheticParams, IMAGES_KEY, LABELS_KEY, SYNTHETIC};
pub use loader::{Batches, DataLoader};
