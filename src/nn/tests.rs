use super::*;
use crate::error::Error;
use crate::Tensor;
use approx::assert_abs_diff_eq;
use ndarray::{Array4, IxDyn};

fn conv_bn_relu_block() -> Module {
    let mut conv = Module::conv2d(Conv2dSpec::new(1, 2, 3).with_padding(1).without_bias());
    conv.param_mut("weight")
        .unwrap()
        .iter_mut()
        .enumerate()
        .for_each(|(i, w)| *w = (i as f32 * 0.37).sin());
    let mut bn = Module::batch_norm2d(BatchNormSpec::new(2));
    bn.param_mut("weight").unwrap().assign(&ndarray::arr1(&[0.5f32, 2.0]).into_dyn());
    bn.param_mut("bias").unwrap().assign(&ndarray::arr1(&[0.1f32, -0.2]).into_dyn());
    bn.float_buffer_mut("running_mean")
        .unwrap()
        .assign(&ndarray::arr1(&[0.3f32, -0.1]).into_dyn());
    bn.float_buffer_mut("running_var")
        .unwrap()
        .assign(&ndarray::arr1(&[1.5f32, 0.5]).into_dyn());
    Module::new(Layer::Sequential).with_child(
        "features",
        Module::sequential(vec![conv, bn, Module::relu()]),
    )
}

fn sample_input() -> Tensor {
    Array4::from_shape_fn((2, 1, 4, 4), |(n, _, y, x)| (n + y * 4 + x) as f32 / 10.0 - 0.5)
        .into_dyn()
}

#[test]
fn test_submodule_resolves_dotted_path() {
    let model = conv_bn_relu_block();
    let bn = model.submodule("features.1").unwrap();
    assert_eq!(bn.layer().name(), "BatchNorm2d");
    assert_eq!(model.submodule("").unwrap().layer().name(), "Sequential");
}

#[test]
fn test_submodule_unknown_segment_is_not_found() {
    let model = conv_bn_relu_block();
    let err = model.submodule("features.7").unwrap_err();
    assert!(matches!(err, Error::ModuleNotFound(p) if p == "features.7"));
    assert!(model.submodule("features.1.weight").is_err());
}

#[test]
fn test_state_dict_keys_follow_tree() {
    let dict = conv_bn_relu_block().state_dict();
    let keys: Vec<&str> = dict.keys().collect();
    assert_eq!(
        keys,
        vec![
            "features.0.weight",
            "features.1.bias",
            "features.1.running_mean",
            "features.1.running_var",
            "features.1.weight",
        ]
    );
}

#[test]
fn test_load_state_dict_is_strict() {
    let mut model = conv_bn_relu_block();
    let mut dict = model.state_dict();
    dict.remove("features.1.bias");
    assert!(matches!(
        model.load_state_dict(&dict),
        Err(Error::MissingKeys(k)) if k == vec!["features.1.bias".to_string()]
    ));

    let mut dict = model.state_dict();
    dict.insert("features.9.weight", Tensor::zeros(IxDyn(&[1])));
    assert!(matches!(model.load_state_dict(&dict), Err(Error::UnexpectedKeys(_))));

    let mut dict = model.state_dict();
    dict.insert("features.1.bias", Tensor::zeros(IxDyn(&[3])));
    assert!(matches!(model.load_state_dict(&dict), Err(Error::ShapeMismatch { .. })));
}

#[test]
fn test_load_state_dict_roundtrip_restores_values() {
    let source = conv_bn_relu_block();
    let mut target = conv_bn_relu_block();
    target
        .submodule_mut("features.0")
        .unwrap()
        .param_mut("weight")
        .unwrap()
        .fill(0.0);
    target.load_state_dict(&source.state_dict()).unwrap();
    assert_eq!(target.state_dict(), source.state_dict());
}

#[test]
fn test_effective_param_multiplies_mask() {
    let mut linear = Module::linear(LinearSpec::new(2, 1));
    let weight = linear.remove_param("weight").unwrap() + 3.0;
    linear.add_param("weight_orig", weight);
    linear.add_buffer(
        "weight_mask",
        ndarray::arr2(&[[1.0f32, 0.0]]).into_dyn(),
    );
    let effective = linear.effective_param("weight").unwrap();
    assert_eq!(effective.iter().copied().collect::<Vec<_>>(), vec![3.0, 0.0]);
    assert!(linear.is_reparameterized());
}

#[test]
fn test_train_eval_recurses() {
    let mut model = conv_bn_relu_block();
    model.eval();
    assert!(model
        .named_modules()
        .iter()
        .all(|(_, m)| !m.is_training()));
    model.train(true);
    assert!(model.submodule("features.2").unwrap().is_training());
}

#[test]
fn test_fuse_in_training_keeps_bn_child() {
    let mut model = conv_bn_relu_block();
    let report = fuse_model(&mut model).unwrap();
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].pattern, FusionPattern::ConvBnReLU);
    assert_eq!(report.absorbed(), vec!["features.1", "features.2"]);

    let fused = model.submodule("features.0").unwrap();
    assert_eq!(fused.layer().name(), "ConvBnReLU2d");
    assert!(fused.child(BN).is_some());
    assert_eq!(model.submodule("features.1").unwrap().layer(), &Layer::Identity);
    assert_eq!(
        report.original_key("features.0.bn.weight_mask"),
        "features.1.weight_mask"
    );
    assert_eq!(report.original_key("features.0.weight"), "features.0.weight");
}

#[test]
fn test_fuse_in_eval_folds_bn_and_preserves_output() {
    let mut reference = conv_bn_relu_block();
    reference.eval();
    let x = sample_input();
    let expected = reference.forward(&x).unwrap();

    let mut fused = reference.clone();
    fuse_model(&mut fused).unwrap();
    let head = fused.submodule("features.0").unwrap();
    assert_eq!(head.layer().name(), "ConvReLU2d");
    assert!(head.param("bias").is_some());
    let actual = fused.forward(&x).unwrap();
    for (a, b) in actual.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-4);
    }
}

#[test]
fn test_conv_bn_eval_matches_unfused() {
    let mut reference = conv_bn_relu_block();
    let mut fused = reference.clone();
    fuse_model(&mut fused).unwrap();
    reference.eval();
    fused.eval();
    let x = sample_input();
    let expected = reference.forward(&x).unwrap();
    let actual = fused.forward(&x).unwrap();
    for (a, b) in actual.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-4);
    }
}

#[test]
fn test_fuse_rejects_reparameterized_modules() {
    let mut model = conv_bn_relu_block();
    let conv = model.submodule_mut("features.0").unwrap();
    let w = conv.remove_param("weight").unwrap();
    conv.add_param("weight_orig", w);
    assert!(matches!(fuse_model(&mut model), Err(Error::Unsupported(_))));
}

#[test]
fn test_linear_relu_fusion() {
    let mut model = Module::sequential(vec![
        Module::flatten(),
        Module::linear(LinearSpec::new(4, 3)),
        Module::relu(),
        Module::linear(LinearSpec::new(3, 2)),
    ]);
    let report = fuse_model(&mut model).unwrap();
    assert_eq!(report.groups[0].pattern, FusionPattern::LinearReLU);
    assert_eq!(model.submodule("1").unwrap().layer().name(), "LinearReLU");
    assert_eq!(model.submodule("3").unwrap().layer().name(), "Linear");
}

#[test]
fn test_batch_norm_training_updates_running_stats() {
    let mut bn = Module::batch_norm2d(BatchNormSpec::new(1));
    let x = Tensor::from_elem(IxDyn(&[2, 1, 2, 2]), 4.0);
    let y = bn.forward(&x).unwrap();
    assert!(y.iter().all(|v| v.abs() < 1e-3));
    let mean = bn.float_buffer("running_mean").unwrap();
    assert_abs_diff_eq!(mean[[0]], 0.4, epsilon = 1e-6);
}

#[test]
fn test_forward_capture_returns_head_input() {
    let mut model = Module::sequential(vec![
        Module::flatten(),
        Module::linear(LinearSpec::new(4, 2)),
    ]);
    let x = Tensor::ones(IxDyn(&[3, 1, 2, 2]));
    let (out, captured) = model.forward_capture(&x, "1").unwrap();
    assert_eq!(out.shape(), &[3, 2]);
    assert_eq!(captured.shape(), &[3, 4]);
    assert!(model.forward_capture(&x, "5").is_err());
}

#[test]
fn test_ops_shapes() {
    let x = sample_input();
    assert_eq!(ops::max_pool2d(&x, 2, 2).unwrap().shape(), &[2, 1, 2, 2]);
    assert_eq!(ops::global_avg_pool(&x).unwrap().shape(), &[2, 1, 1, 1]);
    assert_eq!(ops::flatten(&x).unwrap().shape(), &[2, 16]);
    let w = Tensor::ones(IxDyn(&[3, 1, 3, 3]));
    assert_eq!(ops::conv2d(&x, &w, None, 1, 0).unwrap().shape(), &[2, 3, 2, 2]);
    assert!(ops::conv2d(&x, &Tensor::ones(IxDyn(&[3, 2, 3, 3])), None, 1, 0).is_err());
}
