//! Model registry
//!
//! `MODEL_NAME` selects a builder and `MODEL_PARAMS` sizes it. Every model
//! is a root `Sequential` wrapped in `QuantStub`/`DeQuantStub` so that it
//! can be prepared and converted as a whole.

use crate::config::{param_usize, Params};
use crate::error::{Error, Result};
use crate::nn::{BatchNormSpec, Conv2dSpec, Layer, LinearSpec, Module};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Registered model names
pub const MODEL_NAMES: &[&str] = &["simplenet", "mlp"];

/// Build a freshly initialized model
///
/// Conv and linear weights and biases are drawn from
/// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` with a generator seeded by `seed`.
pub fn build_model(name: &str, params: &Params, seed: u64) -> Result<Module> {
    let mut model = match name {
        "simplenet" => simplenet(params)?,
        "mlp" => mlp(params)?,
        other => return Err(Error::UnknownModel(other.to_string())),
    };
    initialize(&mut model, seed)?;
    Ok(model)
}

/// Two conv/bn/relu stages, global pooling and a linear head
fn simplenet(params: &Params) -> Result<Module> {
    let in_channels = param_usize(params, "in_channels", 1)?;
    let width = param_usize(params, "width", 8)?;
    let num_classes = param_usize(params, "num_classes", 10)?;
    let features = Module::sequential(vec![
        Module::conv2d(Conv2dSpec::new(in_channels, width, 3).with_padding(1).without_bias()),
        Module::batch_norm2d(BatchNormSpec::new(width)),
        Module::relu(),
        Module::max_pool2d(2, 2),
        Module::conv2d(Conv2dSpec::new(width, 2 * width, 3).with_padding(1).without_bias()),
        Module::batch_norm2d(BatchNormSpec::new(2 * width)),
        Module::relu(),
        Module::adaptive_avg_pool2d(),
    ]);
    Ok(Module::new(Layer::Sequential)
        .with_child("quant", Module::new(Layer::QuantStub))
        .with_child("features", features)
        .with_child("flatten", Module::flatten())
        .with_child("classifier", Module::linear(LinearSpec::new(2 * width, num_classes)))
        .with_child("dequant", Module::new(Layer::DeQuantStub)))
}

fn mlp(params: &Params) -> Result<Module> {
    let in_features = param_usize(params, "in_features", 256)?;
    let hidden = param_usize(params, "hidden", 32)?;
    let num_classes = param_usize(params, "num_classes", 10)?;
    Ok(Module::new(Layer::Sequential)
        .with_child("quant", Module::new(Layer::QuantStub))
        .with_child("flatten", Module::flatten())
        .with_child("fc1", Module::linear(LinearSpec::new(in_features, hidden)))
        .with_child("relu", Module::relu())
        .with_child("classifier", Module::linear(LinearSpec::new(hidden, num_classes)))
        .with_child("dequant", Module::new(Layer::DeQuantStub)))
}

fn initialize(model: &mut Module, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    model.apply(&mut |_: &str, module: &mut Module| {
        let fan_in = match module.layer() {
            Layer::Conv2d(spec) => spec.in_channels * spec.kernel_size * spec.kernel_size,
            Layer::Linear(spec) => spec.in_features,
            _ => return Ok(()),
        };
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        for name in ["weight", "bias"] {
            if let Some(t) = module.param_mut(name) {
                t.mapv_inplace(|_| rng.random_range(-bound..bound));
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Forward;
    use crate::Tensor;
    use ndarray::IxDyn;

    fn params(entries: &[(&str, usize)]) -> Params {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
            .collect()
    }

    #[test]
    fn test_simplenet_layout() {
        let model = build_model("simplenet", &params(&[("num_classes", 4)]), 0).unwrap();
        let names: Vec<&str> = model.children().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["quant", "features", "flatten", "classifier", "dequant"]);
        assert!(matches!(
            model.submodule("features.1").unwrap().layer(),
            Layer::BatchNorm2d(_)
        ));
        assert!(model.submodule("features.0").unwrap().param("bias").is_none());
    }

    #[test]
    fn test_simplenet_forward_shape() {
        let mut model = build_model("simplenet", &params(&[("num_classes", 4), ("width", 4)]), 1).unwrap();
        model.eval();
        let out = model.forward(&Tensor::ones(IxDyn(&[2, 1, 8, 8]))).unwrap();
        assert_eq!(out.shape(), &[2, 4]);
    }

    #[test]
    fn test_mlp_forward_shape() {
        let p = params(&[("in_features", 16), ("hidden", 5), ("num_classes", 3)]);
        let mut model = build_model("mlp", &p, 1).unwrap();
        let out = model.forward(&Tensor::ones(IxDyn(&[2, 1, 4, 4]))).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
    }

    #[test]
    fn test_initialization_is_seeded_and_bounded() {
        let a = build_model("simplenet", &Params::new(), 5).unwrap();
        let b = build_model("simplenet", &Params::new(), 5).unwrap();
        let c = build_model("simplenet", &Params::new(), 6).unwrap();
        assert_eq!(a.state_dict(), b.state_dict());
        assert_ne!(a.state_dict(), c.state_dict());
        let bound = 1.0 / 9.0f32.sqrt();
        let w = a.submodule("features.0").unwrap().param("weight").unwrap();
        assert!(w.iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn test_unknown_model() {
        assert!(matches!(
            build_model("resnet", &Params::new(), 0),
            Err(Error::UnknownModel(name)) if name == "resnet"
        ));
    }
}
