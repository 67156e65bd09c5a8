use super::*;
use crate::nn::{fuse_model, BaseKind, BatchNormSpec, Conv2dSpec, Forward, Layer, LinearSpec, Module};
use crate::Tensor;
use ndarray::IxDyn;

fn net() -> Module {
    let mut conv = Module::conv2d(Conv2dSpec::new(1, 2, 3).with_padding(1).without_bias());
    conv.param_mut("weight").unwrap().fill(0.25);
    let mut model = Module::new(Layer::Sequential)
        .with_child(
            "features",
            Module::sequential(vec![
                conv,
                Module::batch_norm2d(BatchNormSpec::new(2)),
                Module::relu(),
                Module::adaptive_avg_pool2d(),
            ]),
        )
        .with_child("flatten", Module::flatten())
        .with_child("classifier", Module::linear(LinearSpec::new(2, 3)));
    model
        .submodule_mut("classifier")
        .unwrap()
        .param_mut("weight")
        .unwrap()
        .fill(1.0);
    model
}

fn pruned_masks(model: &Module) -> MaskMap {
    let mut masks = MaskMap::new();
    for key in ["features.0.weight", "features.1.weight", "classifier.weight"] {
        let shape = model.state_dict().get(key).unwrap().shape().to_vec();
        let mut mask = Tensor::ones(IxDyn(&shape));
        mask.iter_mut().step_by(2).for_each(|v| *v = 0.0);
        masks.insert(format!("{key}_mask"), mask);
    }
    masks
}

#[test]
fn test_registry_lists_prunable_tensors_in_order() {
    let registry = ParamRegistry::from_model(&net());
    assert_eq!(
        registry.keys(),
        vec![
            "features.0.weight",
            "features.1.weight",
            "features.1.bias",
            "classifier.weight",
            "classifier.bias",
        ]
    );
    assert_eq!(registry.iter().nth(1).unwrap().kind, BaseKind::BatchNorm2d);
}

#[test]
fn test_registry_counts_fused_modules_as_base_layers() {
    let mut model = net();
    fuse_model(&mut model).unwrap();
    let registry = ParamRegistry::from_model(&model);
    assert!(registry.keys().contains(&"features.0.bn.weight".to_string()));
    assert_eq!(registry.iter().next().unwrap().kind, BaseKind::Conv2d);
}

#[test]
fn test_dummy_pruning_reparameterizes_with_ones() {
    let mut model = net();
    let registry = ParamRegistry::from_model(&model);
    dummy_pruning(&mut model, &registry).unwrap();
    let dict = model.state_dict();
    assert!(dict.contains_key("features.0.weight_orig"));
    assert!(!dict.contains_key("features.0.weight"));
    let mask = dict.get("features.0.weight_mask").unwrap().as_float().unwrap();
    assert!(mask.iter().all(|&v| v == 1.0));
    assert_eq!(model.reparameterized_paths().len(), 3);
}

#[test]
fn test_apply_and_remove_are_idempotent() {
    let mut model = net();
    let registry = ParamRegistry::from_model(&model);

    dummy_pruning(&mut model, &registry).unwrap();
    let once = model.state_dict();
    dummy_pruning(&mut model, &registry).unwrap();
    assert_eq!(model.state_dict(), once);

    remove_pruning_reparameterization(&mut model, &registry).unwrap();
    let removed = model.state_dict();
    remove_pruning_reparameterization(&mut model, &registry).unwrap();
    assert_eq!(model.state_dict(), removed);
    assert_eq!(removed, net().state_dict());
}

#[test]
fn test_remove_bakes_mask_into_weight() {
    let mut model = net();
    let registry = ParamRegistry::from_model(&model);
    dummy_pruning(&mut model, &registry).unwrap();
    let masks = pruned_masks(&net());
    install_masks(&mut model, &masks).unwrap();
    remove_pruning_reparameterization(&mut model, &registry).unwrap();

    let weight = model.submodule("classifier").unwrap().param("weight").unwrap();
    let mask = masks.get("classifier.weight_mask").unwrap();
    assert_eq!(weight, mask);
    assert!(get_masks(&model).is_empty());
}

#[test]
fn test_get_masks_collects_mask_buffers() {
    let mut model = net();
    let registry = ParamRegistry::from_model(&model);
    dummy_pruning(&mut model, &registry).unwrap();
    let masks = get_masks(&model);
    assert_eq!(masks.len(), registry.len());
    assert!(masks.keys().all(|k| k.ends_with("_mask")));
    assert_eq!(masks.sparsity(), 0.0);
}

#[test]
fn test_install_masks_requires_existing_module() {
    let mut model = net();
    let mut masks = MaskMap::new();
    masks.insert("features.9.weight_mask", Tensor::ones(IxDyn(&[1])));
    assert!(install_masks(&mut model, &masks).is_err());
}

#[test]
fn test_reinstall_translates_fused_paths() {
    let source = net();
    let masks = pruned_masks(&source);
    let mut model = source.clone();
    let report = fuse_model(&mut model).unwrap();
    let registry = reinstall_masks(&mut model, &masks, &report).unwrap();
    assert!(!registry.is_empty());

    let bn = model.submodule("features.0.bn").unwrap();
    assert_eq!(
        bn.float_buffer("weight_mask").unwrap(),
        masks.get("features.1.weight_mask").unwrap()
    );
    let bias_mask = bn.float_buffer("bias_mask").unwrap();
    assert!(bias_mask.iter().all(|&v| v == 1.0));
}

#[test]
fn test_reinstall_rejects_shape_mismatch() {
    let source = net();
    let mut masks = MaskMap::new();
    masks.insert("classifier.weight_mask", Tensor::ones(IxDyn(&[2, 2])));
    let mut model = source.clone();
    let report = fuse_model(&mut model).unwrap();
    assert!(reinstall_masks(&mut model, &masks, &report).is_err());
}

#[test]
fn test_masked_forward_zeroes_pruned_weights() {
    let mut model = net();
    let registry = ParamRegistry::from_model(&model);
    dummy_pruning(&mut model, &registry).unwrap();
    let mut zero = MaskMap::new();
    zero.insert("classifier.weight_mask", Tensor::zeros(IxDyn(&[3, 2])));
    install_masks(&mut model, &zero).unwrap();
    model.eval();
    let y = model.forward(&Tensor::ones(IxDyn(&[1, 1, 4, 4]))).unwrap();
    assert!(y.iter().all(|&v| v == 0.0));
}
