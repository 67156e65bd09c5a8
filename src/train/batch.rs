//! Batch data structure

use crate::Tensor;

/// A batch of NCHW images with class labels
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Vec<usize>,
}

impl Batch {
    pub fn new(inputs: Tensor, targets: Vec<usize>) -> Self {
        Self { inputs, targets }
    }

    /// Number of samples
    pub fn size(&self) -> usize {
        self.targets.len()
    }
}
