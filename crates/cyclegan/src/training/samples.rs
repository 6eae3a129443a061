//! Sample images written after each validation pass.

use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::prelude::*;
use faces::BatchLoader;
use image::RgbImage;
use rand::rngs::StdRng;

use crate::model::bridge::{batch_to_tensors, tensor_to_images};
use crate::model::Generator;

/// Receives the current young→old generator once per epoch.
pub trait SampleSink<B: Backend> {
    /// Generate and persist samples; returns how many were written.
    fn save(
        &mut self,
        epoch: usize,
        generator: &Generator<B>,
        loader: &dyn BatchLoader,
        device: &B::Device,
        rng: &mut StdRng,
    ) -> anyhow::Result<usize>;
}

/// Discards every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSamples;

impl<B: Backend> SampleSink<B> for NoSamples {
    fn save(
        &mut self,
        _epoch: usize,
        _generator: &Generator<B>,
        _loader: &dyn BatchLoader,
        _device: &B::Device,
        _rng: &mut StdRng,
    ) -> anyhow::Result<usize> {
        Ok(0)
    }
}

/// Writes `samples/epoch_NNN/sample_K.png`, each a real young face beside
/// its generated old counterpart.
#[derive(Debug, Clone)]
pub struct PngSampleWriter {
    root: PathBuf,
    count: usize,
}

impl PngSampleWriter {
    pub fn new(root: impl Into<PathBuf>, count: usize) -> Self {
        Self {
            root: root.into(),
            count,
        }
    }

    pub fn epoch_dir(&self, epoch: usize) -> PathBuf {
        self.root.join(format!("epoch_{epoch:03}"))
    }
}

/// Concatenate two equally sized images horizontally.
pub fn side_by_side(left: &RgbImage, right: &RgbImage) -> RgbImage {
    let (w, h) = left.dimensions();
    let mut out = RgbImage::new(w + right.width(), h.max(right.height()));
    for (x, y, px) in left.enumerate_pixels() {
        out.put_pixel(x, y, *px);
    }
    for (x, y, px) in right.enumerate_pixels() {
        out.put_pixel(w + x, y, *px);
    }
    out
}

fn write_png(path: &Path, img: &RgbImage) -> anyhow::Result<()> {
    img.save(path)
        .with_context(|| format!("Failed to write sample {}", path.display()))
}

impl<B: Backend> SampleSink<B> for PngSampleWriter {
    fn save(
        &mut self,
        epoch: usize,
        generator: &Generator<B>,
        loader: &dyn BatchLoader,
        device: &B::Device,
        rng: &mut StdRng,
    ) -> anyhow::Result<usize> {
        if self.count == 0 {
            return Ok(0);
        }
        let dir = self.epoch_dir(epoch);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut written = 0;
        for index in 0..loader.num_batches() {
            if written >= self.count {
                break;
            }
            let batch = loader.load_batch(index, rng)?;
            let (x, _) = batch_to_tensors::<B>(&batch, device);
            let fake = generator.forward(x.clone());

            let real = tensor_to_images(x)?;
            let fake = tensor_to_images(fake)?;
            for (r, f) in real.iter().zip(&fake) {
                if written >= self.count {
                    break;
                }
                write_png(&dir.join(format!("sample_{written}.png")), &side_by_side(r, f))?;
                written += 1;
            }
        }
        tracing::info!(epoch, written, dir = %dir.display(), "Saved samples");
        Ok(written)
    }
}
