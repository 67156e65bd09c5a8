use super::*;
use crate::config::TrainConfig;
use crate::error::Error;
use crate::Tensor;
use ndarray::IxDyn;
use safetensors::tensor::{Dtype, TensorView};
use tempfile::TempDir;

fn small() -> SyntheticParams {
    SyntheticParams {
        num_classes: 3,
        channels: 1,
        image_size: 4,
        train_size: 10,
        test_size: 6,
        noise: 0.1,
    }
}

fn write_dataset(path: &std::path::Path, images: &[f32], shape: &[usize], labels: &[i64]) {
    let image_bytes: Vec<u8> = bytemuck::cast_slice(images).to_vec();
    let label_bytes: Vec<u8> = bytemuck::cast_slice(labels).to_vec();
    let views = vec![
        (
            IMAGES_KEY,
            TensorView::new(Dtype::F32, shape.to_vec(), &image_bytes).unwrap(),
        ),
        (
            LABELS_KEY,
            TensorView::new(Dtype::I64, vec![labels.len()], &label_bytes).unwrap(),
        ),
    ];
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, safetensors::serialize(views, None).unwrap()).unwrap();
}

#[test]
fn test_synthetic_is_deterministic_in_seed() {
    let a = Dataset::synthetic(&small(), Split::Train, 7).unwrap();
    let b = Dataset::synthetic(&small(), Split::Train, 7).unwrap();
    let c = Dataset::synthetic(&small(), Split::Train, 8).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 10);
    assert_eq!(a.image_shape(), &[1, 4, 4]);
    assert_eq!(&a.labels()[..4], &[0, 1, 2, 0]);
}

#[test]
fn test_splits_share_class_prototypes() {
    let mut params = small();
    params.noise = 0.0;
    let train = Dataset::synthetic(&params, Split::Train, 3).unwrap();
    let test = Dataset::synthetic(&params, Split::Test, 3).unwrap();
    let (train_img, _) = train.gather(&[1]);
    let (test_img, _) = test.gather(&[1]);
    assert_eq!(train_img, test_img);
    assert_eq!(test.len(), 6);
}

#[test]
fn test_synthetic_params_from_mapping() {
    let mut config = TrainConfig::new(SYNTHETIC, "mlp");
    config
        .dataset_params
        .insert("num_classes".into(), serde_json::json!(4));
    config
        .dataset_params
        .insert("noise".into(), serde_json::json!(0.5));
    let params = SyntheticParams::from_params(&config.dataset_params).unwrap();
    assert_eq!(params.num_classes, 4);
    assert_eq!(params.noise, 0.5);
    assert_eq!(params.image_size, SyntheticParams::default().image_size);

    config
        .dataset_params
        .insert("num_classes".into(), serde_json::json!(0));
    assert!(matches!(
        SyntheticParams::from_params(&config.dataset_params),
        Err(Error::Dataset(_))
    ));
}

#[test]
fn test_loader_batches_cover_the_dataset_once() {
    let data = Dataset::synthetic(&small(), Split::Train, 1).unwrap();
    let loader = DataLoader::new(data, 4, true, 42);
    assert_eq!(loader.num_batches(), 3);
    let sizes: Vec<usize> = loader.iter(0).map(|b| b.size()).collect();
    assert_eq!(sizes, vec![4, 4, 2]);

    let mut order = loader.order(0);
    order.sort_unstable();
    assert_eq!(order, (0..10).collect::<Vec<_>>());
}

#[test]
fn test_shuffle_is_seeded_per_epoch() {
    let data = Dataset::synthetic(&small(), Split::Train, 1).unwrap();
    let loader = DataLoader::new(data.clone(), 4, true, 42);
    assert_eq!(loader.order(0), DataLoader::new(data.clone(), 4, true, 42).order(0));
    assert_ne!(loader.order(0), loader.order(1));
    let unshuffled = DataLoader::new(data, 4, false, 42);
    assert_eq!(unshuffled.order(5), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_batch_labels_follow_order() {
    let data = Dataset::synthetic(&small(), Split::Test, 1).unwrap();
    let loader = DataLoader::new(data.clone(), 6, true, 9);
    let batch = loader.first().unwrap();
    let expected: Vec<usize> = loader.order(0).iter().map(|&i| data.labels()[i]).collect();
    assert_eq!(batch.targets, expected);
    assert_eq!(batch.inputs.shape(), &[6, 1, 4, 4]);
}

#[test]
fn test_load_dataset_file() {
    let dir = TempDir::new().unwrap();
    let mut config = TrainConfig::new("TOY", "mlp");
    config.data_root = Some(dir.path().to_path_buf());
    let path = split_path(&config, Split::Train);
    assert!(path.ends_with("TOY/train.safetensors"));

    let images: Vec<f32> = (0..8).map(|v| v as f32).collect();
    write_dataset(&path, &images, &[2, 1, 2, 2], &[1, 0]);
    let data = Dataset::from_config(&config, Split::Train).unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data.num_classes(), 2);
    let (img, labels) = data.gather(&[0]);
    assert_eq!(labels, vec![1]);
    assert_eq!(img, Tensor::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![0.0, 1.0, 2.0, 3.0]).unwrap());
}

#[test]
fn test_load_rejects_inconsistent_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad/train.safetensors");
    write_dataset(&path, &[0.0; 8], &[2, 1, 2, 2], &[0, 1, 2]);
    assert!(matches!(Dataset::load(&path, None), Err(Error::Dataset(_))));

    write_dataset(&path, &[0.0; 8], &[2, 1, 2, 2], &[0, 5]);
    assert!(matches!(Dataset::load(&path, Some(3)), Err(Error::Dataset(_))));
    assert!(matches!(
        Dataset::load(dir.path().join("missing.safetensors"), None),
        Err(Error::Dataset(_))
    ));
}
