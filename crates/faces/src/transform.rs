//! Image preprocessing: resize, crop, flip, normalise to `[-1, 1]` CHW.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::Rng;

use crate::types::DataError;

/// Per-image preprocessing for one split.
///
/// Images are resized to `(image_size + resize_margin)^2`, then cropped to
/// `image_size^2` (random crop + random horizontal flip when `augment`,
/// center crop otherwise).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageTransform {
    pub image_size: u32,
    pub resize_margin: u32,
    pub augment: bool,
}

impl ImageTransform {
    /// Randomised transform used for the training split.
    pub fn train(image_size: u32) -> Self {
        Self {
            image_size,
            resize_margin: 50,
            augment: true,
        }
    }

    /// Deterministic transform used for validation and test.
    pub fn eval(image_size: u32) -> Self {
        Self {
            image_size,
            resize_margin: 50,
            augment: false,
        }
    }

    /// Number of `f32` values one transformed image occupies.
    pub fn image_len(&self) -> usize {
        3 * (self.image_size as usize) * (self.image_size as usize)
    }

    /// Open, decode and transform a single image file.
    pub fn load(&self, path: &Path, rng: &mut impl Rng) -> Result<Vec<f32>, DataError> {
        let img = image::open(path)
            .map_err(|source| DataError::Decode {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();
        Ok(self.apply(&img, rng))
    }

    /// Transform a decoded RGB image into normalised CHW values.
    pub fn apply(&self, img: &RgbImage, rng: &mut impl Rng) -> Vec<f32> {
        let resized_side = self.image_size + self.resize_margin;
        let resized = imageops::resize(img, resized_side, resized_side, FilterType::Triangle);

        let slack = resized_side - self.image_size;
        let (left, top) = if self.augment {
            (rng.gen_range(0..=slack), rng.gen_range(0..=slack))
        } else {
            (slack / 2, slack / 2)
        };
        let mut cropped =
            imageops::crop_imm(&resized, left, top, self.image_size, self.image_size).to_image();
        if self.augment && rng.gen_bool(0.5) {
            imageops::flip_horizontal_in_place(&mut cropped);
        }

        to_chw_normalized(&cropped)
    }
}

/// Convert an RGB image to CHW floats with mean 0.5 / std 0.5 normalisation.
pub fn to_chw_normalized(img: &RgbImage) -> Vec<f32> {
    let (w, h) = img.dimensions();
    let plane = (w * h) as usize;
    let mut out = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in img.enumerate_pixels() {
        let offset = (y * w + x) as usize;
        for c in 0..3 {
            out[c * plane + offset] = (pixel[c] as f32 / 255.0 - 0.5) / 0.5;
        }
    }
    out
}
