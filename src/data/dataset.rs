//! Image classification datasets

use crate::config::{param_f64, param_usize, Params, TrainConfig};
use crate::error::{Error, Result};
use crate::io::{f32_values, i64_values};
use crate::Tensor;
use ndarray::{Axis, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use std::path::{Path, PathBuf};

/// Dataset name selecting generated data
pub const SYNTHETIC: &str = "SYNTHETIC";
/// Tensor key of the images in a dataset file
pub const IMAGES_KEY: &str = "images";
/// Tensor key of the labels in a dataset file
pub const LABELS_KEY: &str = "labels";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn file_name(self) -> &'static str {
        match self {
            Split::Train => "train.safetensors",
            Split::Test => "test.safetensors",
        }
    }
}

/// Parameters of generated data (`DATASET_PARAMS`)
///
/// Every class has a fixed random prototype image; samples are the
/// prototype plus uniform noise. Both splits share the prototypes.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticParams {
    pub num_classes: usize,
    pub channels: usize,
    pub image_size: usize,
    pub train_size: usize,
    pub test_size: usize,
    pub noise: f32,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            num_classes: 10,
            channels: 1,
            image_size: 16,
            train_size: 256,
            test_size: 128,
            noise: 0.3,
        }
    }
}

impl SyntheticParams {
    pub fn from_params(params: &Params) -> Result<Self> {
        let d = Self::default();
        let p = Self {
            num_classes: param_usize(params, "num_classes", d.num_classes)?,
            channels: param_usize(params, "channels", d.channels)?,
            image_size: param_usize(params, "image_size", d.image_size)?,
            train_size: param_usize(params, "train_size", d.train_size)?,
            test_size: param_usize(params, "test_size", d.test_size)?,
            noise: param_f64(params, "noise", f64::from(d.noise))? as f32,
        };
        if p.num_classes == 0 || p.channels == 0 || p.image_size == 0 {
            return Err(Error::Dataset(
                "synthetic num_classes, channels and image_size must be positive".into(),
            ));
        }
        Ok(p)
    }
}

/// NCHW float images with class labels
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    images: Tensor,
    labels: Vec<usize>,
    num_classes: usize,
}

impl Dataset {
    pub fn new(images: Tensor, labels: Vec<usize>, num_classes: usize) -> Result<Self> {
        if images.ndim() != 4 {
            return Err(Error::Dataset(format!(
                "images must be NCHW, got shape {:?}",
                images.shape()
            )));
        }
        if images.shape()[0] != labels.len() {
            return Err(Error::Dataset(format!(
                "{} images but {} labels",
                images.shape()[0],
                labels.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(Error::Dataset(format!(
                "label {bad} out of range for {num_classes} classes"
            )));
        }
        Ok(Self {
            images,
            labels,
            num_classes,
        })
    }

    /// Generated split; deterministic in `seed`
    pub fn synthetic(params: &SyntheticParams, split: Split, seed: u64) -> Result<Self> {
        let c = params.channels;
        let s = params.image_size;
        let pixels = c * s * s;
        let mut proto_rng = StdRng::seed_from_u64(seed);
        let prototypes: Vec<Vec<f32>> = (0..params.num_classes)
            .map(|_| (0..pixels).map(|_| proto_rng.random_range(-1.0f32..1.0)).collect())
            .collect();

        let (n, sample_seed) = match split {
            Split::Train => (params.train_size, seed.wrapping_add(1)),
            Split::Test => (params.test_size, seed.wrapping_add(2)),
        };
        let mut rng = StdRng::seed_from_u64(sample_seed);
        let noise = params.noise.abs();
        let mut values = Vec::with_capacity(n * pixels);
        let labels: Vec<usize> = (0..n).map(|i| i % params.num_classes).collect();
        for &label in &labels {
            for &p in &prototypes[label] {
                let jitter = if noise > 0.0 {
                    rng.random_range(-noise..noise)
                } else {
                    0.0
                };
                values.push(p + jitter);
            }
        }
        let images = Tensor::from_shape_vec(IxDyn(&[n, c, s, s]), values)
            .map_err(|e| Error::Dataset(format!("synthetic images: {e}")))?;
        Self::new(images, labels, params.num_classes)
    }

    /// Read `images` (F32, NCHW) and `labels` (I64) from a SafeTensors file
    pub fn load(path: impl AsRef<Path>, num_classes: Option<usize>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| Error::Dataset(format!("{}: {e}", path.display())))?;
        let tensors = SafeTensors::deserialize(&data)
            .map_err(|e| Error::Dataset(format!("{}: {e}", path.display())))?;
        let view = |key: &str| {
            tensors
                .tensor(key)
                .map_err(|e| Error::Dataset(format!("{}: {key}: {e}", path.display())))
        };

        let images = view(IMAGES_KEY)?;
        if images.dtype() != Dtype::F32 {
            return Err(Error::Dataset(format!("{IMAGES_KEY} must be F32")));
        }
        let images = Tensor::from_shape_vec(IxDyn(images.shape()), f32_values(images.data()))
            .map_err(|e| Error::Dataset(format!("{IMAGES_KEY}: {e}")))?;

        let labels = view(LABELS_KEY)?;
        if labels.dtype() != Dtype::I64 {
            return Err(Error::Dataset(format!("{LABELS_KEY} must be I64")));
        }
        let labels = i64_values(labels.data())
            .into_iter()
            .map(|l| usize::try_from(l).map_err(|_| Error::Dataset(format!("negative label {l}"))))
            .collect::<Result<Vec<_>>>()?;

        let num_classes =
            num_classes.unwrap_or_else(|| labels.iter().max().map_or(0, |m| m + 1));
        Self::new(images, labels, num_classes)
    }

    /// Dataset split named by the training config
    pub fn from_config(config: &TrainConfig, split: Split) -> Result<Self> {
        if config.dataset == SYNTHETIC {
            let params = SyntheticParams::from_params(&config.dataset_params)?;
            return Self::synthetic(&params, split, config.seed);
        }
        let num_classes = match config.dataset_params.get("num_classes") {
            Some(_) => Some(param_usize(&config.dataset_params, "num_classes", 0)?),
            None => None,
        };
        Self::load(split_path(config, split), num_classes)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// `[C, H, W]` of one image
    pub fn image_shape(&self) -> &[usize] {
        &self.images.shape()[1..]
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Gather samples by index
    pub fn gather(&self, indices: &[usize]) -> (Tensor, Vec<usize>) {
        let images = self.images.select(Axis(0), indices);
        let labels = indices.iter().map(|&i| self.labels[i]).collect();
        (images, labels)
    }
}

/// `<DATA_ROOT>/<DATASET>/<split>.safetensors`, `DATA_ROOT` defaulting to `data`
pub fn split_path(config: &TrainConfig, split: Split) -> PathBuf {
    config
        .data_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("data"))
        .join(&config.dataset)
        .join(split.file_name())
}
