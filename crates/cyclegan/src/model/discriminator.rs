use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

use crate::model::generator::ConvNorm;

const LEAKY_SLOPE: f64 = 0.2;

/// Configuration for the PatchGAN-style discriminator.
///
/// ```text
/// (batch, C, H, W)
///   → Conv4x4 stride 2 (C→n) → LeakyReLU
///   → [Conv4x4 stride 2 → IN → LeakyReLU] × (n_downsample - 1)
///   → Conv3x3 → IN → LeakyReLU
///   → Conv3x3 (→1)
///   → (batch, 1, H / 2^n_downsample, W / 2^n_downsample) realism logits
/// ```
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    /// Image channels (3 for RGB).
    #[config(default = 3)]
    pub channels: usize,
    /// Filters in the first convolution; doubled at each further downsample.
    #[config(default = 64)]
    pub base_filters: usize,
    /// Number of stride-2 convolutions (at least 1).
    #[config(default = 3)]
    pub n_downsample: usize,
}

/// Patch discriminator: one realism logit per receptive-field patch.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    input: Conv2d<B>,
    down: Vec<ConvNorm<B>>,
    refine: ConvNorm<B>,
    head: Conv2d<B>,
}

impl DiscriminatorConfig {
    /// Initialize a Discriminator with the given configuration.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let n = self.base_filters;
        let mut d = n;
        let mut down = Vec::new();
        for _ in 1..self.n_downsample.max(1) {
            down.push(ConvNorm::new(d, 2 * d, 4, 2, 1, device));
            d *= 2;
        }
        Discriminator {
            input: Conv2dConfig::new([self.channels, n], [4, 4])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            down,
            refine: ConvNorm::new(d, 2 * d, 3, 1, 1, device),
            head: Conv2dConfig::new([2 * d, 1], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
        }
    }
}

impl<B: Backend> Discriminator<B> {
    /// Input shape: `(batch, channels, height, width)`.
    /// Output shape: `(batch, 1, patch_h, patch_w)`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut h = leaky_relu(self.input.forward(x), LEAKY_SLOPE);
        for block in &self.down {
            h = leaky_relu(block.forward(h), LEAKY_SLOPE);
        }
        h = leaky_relu(self.refine.forward(h), LEAKY_SLOPE);
        self.head.forward(h)
    }
}
