//! Tensor bridge: conversions between loader buffers (`Vec<f32>` CHW),
//! burn tensors, and RGB images.
//!
//! The `faces` crate knows nothing about burn; everything crossing that
//! boundary goes through here.

use burn::prelude::*;
use burn::tensor::TensorData;
use faces::ImageBatch;
use image::RgbImage;

/// Convert an unpaired batch into `(x, y)` tensors of shape `(batch, C, H, W)`.
pub fn batch_to_tensors<B: Backend>(
    batch: &ImageBatch,
    device: &B::Device,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let shape = batch.shape();
    let x = Tensor::from_data(TensorData::new(batch.x.clone(), shape), device);
    let y = Tensor::from_data(TensorData::new(batch.y.clone(), shape), device);
    (x, y)
}

/// Extract a single f64 scalar from a burn 1D tensor.
///
/// # Panics
/// Panics if the tensor does not contain exactly one element.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    let val: f32 = tensor.into_scalar().elem();
    val as f64
}

/// Convert images in `[-1, 1]` of shape `(batch, 3, H, W)` to RGB images.
pub fn tensor_to_images<B: Backend>(images: Tensor<B, 4>) -> anyhow::Result<Vec<RgbImage>> {
    let [n, c, h, w] = images.dims();
    anyhow::ensure!(c == 3, "expected 3 channels, got {c}");
    let data: Vec<f32> = images
        .into_data()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("Failed to read image tensor: {e:?}"))?;

    let plane = h * w;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let base = i * c * plane;
        let img = RgbImage::from_fn(w as u32, h as u32, |x, y| {
            let offset = y as usize * w + x as usize;
            let px = |ch: usize| {
                let v = data[base + ch * plane + offset];
                ((v * 0.5 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8
            };
            image::Rgb([px(0), px(1), px(2)])
        });
        out.push(img);
    }
    Ok(out)
}
