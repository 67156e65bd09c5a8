//! Module tree
//!
//! A [`Module`] is a layer plus its named parameters, buffers and children.
//! Paths are dotted child names (`features.0.bn`); tensor keys append the
//! attribute name (`features.0.bn.weight`).

use super::layer::{BatchNormSpec, Conv2dSpec, Layer, LinearSpec};
use super::state::{StateDict, StateTensor};
use crate::error::{Error, Result};
use crate::quant::QConfig;
use crate::Tensor;
use ndarray::IxDyn;
use std::borrow::Cow;
use std::collections::BTreeSet;

/// Suffix of a reparameterized original tensor
pub const ORIG_SUFFIX: &str = "_orig";
/// Suffix of a pruning mask buffer
pub const MASK_SUFFIX: &str = "_mask";

/// Node of the module tree
#[derive(Clone, Debug)]
pub struct Module {
    layer: Layer,
    params: Vec<(String, Tensor)>,
    buffers: Vec<(String, StateTensor)>,
    children: Vec<(String, Module)>,
    training: bool,
    qconfig: Option<QConfig>,
}

impl Module {
    /// Bare module of the given kind
    pub fn new(layer: Layer) -> Self {
        Self {
            layer,
            params: Vec::new(),
            buffers: Vec::new(),
            children: Vec::new(),
            training: true,
            qconfig: None,
        }
    }

    /// Sequential container with children named `0`, `1`, ...
    pub fn sequential(children: Vec<Module>) -> Self {
        let mut module = Self::new(Layer::Sequential);
        for (i, child) in children.into_iter().enumerate() {
            module.add_child(i.to_string(), child);
        }
        module
    }

    /// Convolution with zero weights
    pub fn conv2d(spec: Conv2dSpec) -> Self {
        let mut module = Self::new(Layer::Conv2d(spec));
        module.add_param("weight", Tensor::zeros(IxDyn(&spec.weight_shape())));
        if spec.bias {
            module.add_param("bias", Tensor::zeros(IxDyn(&[spec.out_channels])));
        }
        module
    }

    /// Batch norm with identity affine transform and unit running variance
    pub fn batch_norm2d(spec: BatchNormSpec) -> Self {
        let n = spec.num_features;
        let mut module = Self::new(Layer::BatchNorm2d(spec));
        module.add_param("weight", Tensor::ones(IxDyn(&[n])));
        module.add_param("bias", Tensor::zeros(IxDyn(&[n])));
        module.add_buffer("running_mean", Tensor::zeros(IxDyn(&[n])));
        module.add_buffer("running_var", Tensor::ones(IxDyn(&[n])));
        module
    }

    /// Fully connected layer with zero weights
    pub fn linear(spec: LinearSpec) -> Self {
        let mut module = Self::new(Layer::Linear(spec));
        module.add_param(
            "weight",
            Tensor::zeros(IxDyn(&[spec.out_features, spec.in_features])),
        );
        if spec.bias {
            module.add_param("bias", Tensor::zeros(IxDyn(&[spec.out_features])));
        }
        module
    }

    pub fn relu() -> Self {
        Self::new(Layer::ReLU)
    }

    pub fn max_pool2d(kernel_size: usize, stride: usize) -> Self {
        Self::new(Layer::MaxPool2d {
            kernel_size,
            stride,
        })
    }

    pub fn adaptive_avg_pool2d() -> Self {
        Self::new(Layer::AdaptiveAvgPool2d)
    }

    pub fn flatten() -> Self {
        Self::new(Layer::Flatten)
    }

    pub fn identity() -> Self {
        Self::new(Layer::Identity)
    }

    /// Builder-style child insertion
    pub fn with_child(mut self, name: impl Into<String>, child: Module) -> Self {
        self.add_child(name, child);
        self
    }

    // ---- layer ----

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Change the layer kind keeping tensors and children
    pub fn set_layer(&mut self, layer: Layer) {
        self.layer = layer;
    }

    pub fn qconfig(&self) -> Option<&QConfig> {
        self.qconfig.as_ref()
    }

    pub fn set_qconfig(&mut self, qconfig: Option<QConfig>) {
        self.qconfig = qconfig;
    }

    // ---- parameters ----

    pub fn param(&self, name: &str) -> Option<&Tensor> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn param_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.params
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    /// Register or replace a parameter
    pub fn add_param(&mut self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        match self.params.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = tensor,
            None => self.params.push((name, tensor)),
        }
    }

    pub fn remove_param(&mut self, name: &str) -> Option<Tensor> {
        let idx = self.params.iter().position(|(n, _)| n == name)?;
        Some(self.params.remove(idx).1)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.params.iter().map(|(n, t)| (n.as_str(), t))
    }

    // ---- buffers ----

    pub fn buffer(&self, name: &str) -> Option<&StateTensor> {
        self.buffers.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn buffer_mut(&mut self, name: &str) -> Option<&mut StateTensor> {
        self.buffers
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    /// Float buffer by name
    pub fn float_buffer(&self, name: &str) -> Option<&Tensor> {
        self.buffer(name).and_then(StateTensor::as_float)
    }

    pub fn float_buffer_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.buffer_mut(name).and_then(StateTensor::as_float_mut)
    }

    /// Register or replace a buffer
    pub fn add_buffer(&mut self, name: impl Into<String>, tensor: impl Into<StateTensor>) {
        let name = name.into();
        let tensor = tensor.into();
        match self.buffers.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = tensor,
            None => self.buffers.push((name, tensor)),
        }
    }

    pub fn remove_buffer(&mut self, name: &str) -> Option<StateTensor> {
        let idx = self.buffers.iter().position(|(n, _)| n == name)?;
        Some(self.buffers.remove(idx).1)
    }

    pub fn buffers(&self) -> impl Iterator<Item = (&str, &StateTensor)> {
        self.buffers.iter().map(|(n, t)| (n.as_str(), t))
    }

    // ---- children ----

    pub fn child(&self, name: &str) -> Option<&Module> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, m)| m)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.children
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
    }

    /// Register or replace a child, keeping its position when replaced
    pub fn add_child(&mut self, name: impl Into<String>, child: Module) {
        let name = name.into();
        match self.children.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = child,
            None => self.children.push((name, child)),
        }
    }

    pub fn remove_child(&mut self, name: &str) -> Option<Module> {
        let idx = self.children.iter().position(|(n, _)| n == name)?;
        Some(self.children.remove(idx).1)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &Module)> {
        self.children.iter().map(|(n, m)| (n.as_str(), m))
    }

    pub(crate) fn children_slots_mut(&mut self) -> &mut Vec<(String, Module)> {
        &mut self.children
    }

    /// Resolve a dotted path by walking child names one segment at a time
    ///
    /// The empty path resolves to `self`.
    pub fn submodule(&self, path: &str) -> Result<&Module> {
        if path.is_empty() {
            return Ok(self);
        }
        let mut current = self;
        for segment in path.split('.') {
            current = current
                .child(segment)
                .ok_or_else(|| Error::ModuleNotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// Mutable variant of [`submodule`](Self::submodule)
    pub fn submodule_mut(&mut self, path: &str) -> Result<&mut Module> {
        if path.is_empty() {
            return Ok(self);
        }
        let mut current = self;
        for segment in path.split('.') {
            current = current
                .child_mut(segment)
                .ok_or_else(|| Error::ModuleNotFound(path.to_string()))?;
        }
        Ok(current)
    }

    // ---- traversal ----

    /// All modules in pre-order with their paths; the root has path `""`
    pub fn named_modules(&self) -> Vec<(String, &Module)> {
        let mut out = Vec::new();
        self.collect_modules(String::new(), &mut out);
        out
    }

    fn collect_modules<'a>(&'a self, prefix: String, out: &mut Vec<(String, &'a Module)>) {
        out.push((prefix.clone(), self));
        for (name, child) in &self.children {
            child.collect_modules(join(&prefix, name), out);
        }
    }

    /// Visit every module mutably in pre-order
    pub fn apply<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(&str, &mut Module) -> Result<()>,
    {
        self.apply_at("", f)
    }

    fn apply_at<F>(&mut self, path: &str, f: &mut F) -> Result<()>
    where
        F: FnMut(&str, &mut Module) -> Result<()>,
    {
        f(path, self)?;
        for (name, child) in &mut self.children {
            child.apply_at(&join(path, name), f)?;
        }
        Ok(())
    }

    /// Parameters with full dotted keys
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        self.named_modules()
            .into_iter()
            .flat_map(|(path, m)| m.params.iter().map(move |(n, t)| (join(&path, n), t)))
            .collect()
    }

    /// Buffers with full dotted keys
    pub fn named_buffers(&self) -> Vec<(String, &StateTensor)> {
        self.named_modules()
            .into_iter()
            .flat_map(|(path, m)| m.buffers.iter().map(move |(n, t)| (join(&path, n), t)))
            .collect()
    }

    /// Total number of float parameter elements
    pub fn num_parameters(&self) -> usize {
        self.named_parameters().iter().map(|(_, t)| t.len()).sum()
    }

    // ---- state ----

    /// Snapshot of all parameters and buffers
    pub fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::new();
        for (key, tensor) in self.named_parameters() {
            dict.insert(key, tensor.clone());
        }
        for (key, tensor) in self.named_buffers() {
            dict.insert(key, tensor.clone());
        }
        dict
    }

    /// Strict load: key sets must match exactly and shapes must agree
    pub fn load_state_dict(&mut self, dict: &StateDict) -> Result<()> {
        let expected = self.state_dict();
        let expected_keys: BTreeSet<&str> = expected.keys().collect();
        let given_keys: BTreeSet<&str> = dict.keys().collect();

        let missing: Vec<String> = expected_keys
            .difference(&given_keys)
            .map(|k| (*k).to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingKeys(missing));
        }
        let unexpected: Vec<String> = given_keys
            .difference(&expected_keys)
            .map(|k| (*k).to_string())
            .collect();
        if !unexpected.is_empty() {
            return Err(Error::UnexpectedKeys(unexpected));
        }

        for (key, current) in expected.iter() {
            let Some(incoming) = dict.get(key) else {
                continue;
            };
            if current.shape() != incoming.shape() {
                return Err(Error::shape_mismatch(key, current.shape(), incoming.shape()));
            }
            if !current.same_kind(incoming) {
                return Err(Error::Serialization(format!(
                    "{key}: expected {} tensor, got {}",
                    current.dtype_name(),
                    incoming.dtype_name()
                )));
            }
        }

        for (key, incoming) in dict.iter() {
            self.set_tensor(key, incoming.clone())?;
        }
        Ok(())
    }

    /// Assign a parameter or buffer by full dotted key
    pub fn set_tensor(&mut self, key: &str, tensor: StateTensor) -> Result<()> {
        let (path, attr) = split_key(key);
        let module = self.submodule_mut(path)?;
        if module.param(attr).is_some() {
            let StateTensor::Float(t) = tensor else {
                return Err(Error::Serialization(format!(
                    "{key}: parameters must be float"
                )));
            };
            module.add_param(attr, t);
        } else {
            module.add_buffer(attr, tensor);
        }
        Ok(())
    }

    // ---- modes ----

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Set training mode recursively
    pub fn train(&mut self, training: bool) {
        self.training = training;
        for (_, child) in &mut self.children {
            child.train(training);
        }
    }

    /// Shorthand for `train(false)`
    pub fn eval(&mut self) {
        self.train(false);
    }

    // ---- pruning reparameterization ----

    /// Tensor as seen by the forward pass
    ///
    /// A reparameterized tensor `name` is stored as `name_orig` and
    /// `name_mask` and is materialized as their product.
    pub fn effective_param(&self, name: &str) -> Option<Cow<'_, Tensor>> {
        if let Some(t) = self.param(name) {
            return Some(Cow::Borrowed(t));
        }
        let orig = self.param(&format!("{name}{ORIG_SUFFIX}"))?;
        let mask = self.float_buffer(&format!("{name}{MASK_SUFFIX}"))?;
        Some(Cow::Owned(orig * mask))
    }

    /// Whether this module holds any `_orig` parameter
    pub fn is_reparameterized(&self) -> bool {
        self.params.iter().any(|(n, _)| n.ends_with(ORIG_SUFFIX))
    }

    /// Paths of reparameterized modules in the tree
    pub fn reparameterized_paths(&self) -> Vec<String> {
        self.named_modules()
            .into_iter()
            .filter(|(_, m)| m.is_reparameterized())
            .map(|(p, _)| p)
            .collect()
    }
}

/// Join a module path and a name
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Split `a.b.weight` into (`a.b`, `weight`)
pub fn split_key(key: &str) -> (&str, &str) {
    match key.rsplit_once('.') {
        Some((path, attr)) => (path, attr),
        None => ("", key),
    }
}
