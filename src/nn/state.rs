//! State dict: named tensor snapshot of a module tree

use crate::quant::QTensor;
use crate::Tensor;
use std::collections::BTreeMap;

/// A tensor held in a state dict: float or quantized
#[derive(Clone, Debug, PartialEq)]
pub enum StateTensor {
    /// 32-bit float tensor
    Float(Tensor),
    /// Integer tensor with quantization parameters
    Quantized(QTensor),
}

impl StateTensor {
    /// Shape of the tensor
    pub fn shape(&self) -> &[usize] {
        match self {
            StateTensor::Float(t) => t.shape(),
            StateTensor::Quantized(q) => q.shape(),
        }
    }

    /// Float view, if this is a float tensor
    pub fn as_float(&self) -> Option<&Tensor> {
        match self {
            StateTensor::Float(t) => Some(t),
            StateTensor::Quantized(_) => None,
        }
    }

    /// Mutable float view, if this is a float tensor
    pub fn as_float_mut(&mut self) -> Option<&mut Tensor> {
        match self {
            StateTensor::Float(t) => Some(t),
            StateTensor::Quantized(_) => None,
        }
    }

    /// Quantized view, if this is a quantized tensor
    pub fn as_quantized(&self) -> Option<&QTensor> {
        match self {
            StateTensor::Quantized(q) => Some(q),
            StateTensor::Float(_) => None,
        }
    }

    /// Datatype name (`float32`, `qint8`, `quint8`)
    pub fn dtype_name(&self) -> &'static str {
        match self {
            StateTensor::Float(_) => "float32",
            StateTensor::Quantized(q) => q.dtype().name(),
        }
    }

    /// Whether both tensors have the same storage kind
    pub fn same_kind(&self, other: &StateTensor) -> bool {
        matches!(
            (self, other),
            (StateTensor::Float(_), StateTensor::Float(_))
                | (StateTensor::Quantized(_), StateTensor::Quantized(_))
        )
    }
}

impl From<Tensor> for StateTensor {
    fn from(t: Tensor) -> Self {
        StateTensor::Float(t)
    }
}

impl From<QTensor> for StateTensor {
    fn from(q: QTensor) -> Self {
        StateTensor::Quantized(q)
    }
}

/// Dotted name -> tensor mapping, ordered by name
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateDict {
    entries: BTreeMap<String, StateTensor>,
}

impl StateDict {
    /// Empty state dict
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry
    pub fn insert(&mut self, name: impl Into<String>, tensor: impl Into<StateTensor>) {
        self.entries.insert(name.into(), tensor.into());
    }

    /// Look up an entry
    pub fn get(&self, name: &str) -> Option<&StateTensor> {
        self.entries.get(name)
    }

    /// Remove an entry
    pub fn remove(&mut self, name: &str) -> Option<StateTensor> {
        self.entries.remove(name)
    }

    /// Whether the entry exists
    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Entry names in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &StateTensor)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any key carries the pruning mask marker
    pub fn has_masks(&self) -> bool {
        self.keys().any(|k| k.contains("mask"))
    }

    /// Keys carrying the pruning mask marker
    pub fn mask_keys(&self) -> Vec<&str> {
        self.keys().filter(|k| k.contains("mask")).collect()
    }
}

impl FromIterator<(String, StateTensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, StateTensor)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for StateDict {
    type Item = (String, StateTensor);
    type IntoIter = std::collections::btree_map::IntoIter<String, StateTensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
