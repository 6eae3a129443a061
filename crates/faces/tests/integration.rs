//! Integration tests for the faces crate: directory scan -> split -> loader,
//! using small synthetic JPGs written to a temp directory.

use std::path::Path;

use faces::{
    AgeThresholds, BatchLoader, DataError, FaceIndex, Split, UnpairedLoader, UTKFACE_SUBDIR,
};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

/// Helper: write `count` solid-colour JPGs for the given age.
fn write_faces(root: &Path, age: u32, count: usize, shade: u8) {
    for i in 0..count {
        let img = RgbImage::from_pixel(24, 24, image::Rgb([shade, shade / 2, 255 - shade]));
        img.save(root.join(format!("{age}_0_0_2017011{i:04}.jpg")))
            .unwrap();
    }
}

fn dataset(young: usize, old: usize) -> TempDir {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join(UTKFACE_SUBDIR);
    std::fs::create_dir_all(&root).unwrap();
    write_faces(&root, 22, young, 40);
    write_faces(&root, 65, old, 200);
    // Between the two domains: ignored.
    write_faces(&root, 33, 2, 120);
    // No age prefix: skipped with a warning.
    std::fs::write(root.join("readme.jpg"), b"not an image").unwrap();
    tmp
}

#[test]
fn test_scan_buckets_by_age() {
    let tmp = dataset(10, 10);
    let index = FaceIndex::scan(tmp.path(), &AgeThresholds::default()).unwrap();
    assert_eq!(index.young().len(), 10);
    assert_eq!(index.old().len(), 10);
    assert!(index.young().iter().all(|r| r.age == 22));
}

#[test]
fn test_missing_directory_is_no_images() {
    let tmp = TempDir::new().unwrap();
    let err = FaceIndex::scan(tmp.path(), &AgeThresholds::default()).unwrap_err();
    assert!(matches!(err, DataError::NoImages(_)), "got {err}");
}

#[test]
fn test_empty_directory_is_no_images() {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join(UTKFACE_SUBDIR)).unwrap();
    let err = FaceIndex::scan(tmp.path(), &AgeThresholds::default()).unwrap_err();
    assert!(matches!(err, DataError::NoImages(_)), "got {err}");
}

#[test]
fn test_one_domain_empty_fails() {
    let tmp = dataset(5, 0);
    let err = FaceIndex::scan(tmp.path(), &AgeThresholds::default()).unwrap_err();
    assert!(
        matches!(err, DataError::EmptyDomain { young: 5, old: 0 }),
        "got {err}"
    );
}

#[test]
fn test_train_loader_end_to_end() {
    let tmp = dataset(10, 10);
    let index = FaceIndex::scan(tmp.path(), &AgeThresholds::default()).unwrap();
    let train = index.split(Split::Train, 42);
    assert_eq!(train.len(), 8);

    let mut loader = UnpairedLoader::train(train, 8, 3, 2).unwrap();
    // 8 items, batch 3, drop_last -> 2 batches
    assert_eq!(loader.num_batches(), 2);

    let mut rng = StdRng::seed_from_u64(0);
    loader.begin_pass(&mut rng);
    let batch = loader.load_batch(0, &mut rng).unwrap();
    assert_eq!(batch.shape(), [3, 3, 8, 8]);
    assert!(batch.x.iter().all(|v| v.is_finite() && (-1.0..=1.0).contains(v)));

    // Young faces are dark red-ish, old faces bright: the red planes differ.
    let plane = 8 * 8;
    let x_red: f32 = batch.x[..plane].iter().sum::<f32>() / plane as f32;
    let y_red: f32 = batch.y[..plane].iter().sum::<f32>() / plane as f32;
    assert!(y_red > x_red, "old-domain red mean {y_red} should exceed young {x_red}");
}

#[test]
fn test_eval_loader_keeps_partial_batch() {
    let tmp = dataset(20, 20);
    let index = FaceIndex::scan(tmp.path(), &AgeThresholds::default()).unwrap();
    let valid = index.split(Split::Valid, 42);
    // floor(18) - floor(16) = 2 per side
    assert_eq!(valid.len(), 2);

    let mut loader = UnpairedLoader::eval(valid, 8, 3, 1).unwrap();
    assert_eq!(loader.num_batches(), 1);
    let mut rng = StdRng::seed_from_u64(0);
    loader.begin_pass(&mut rng);
    let batch = loader.load_batch(0, &mut rng).unwrap();
    assert_eq!(batch.batch_size, 2);
}
