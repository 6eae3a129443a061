use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{InstanceNorm, InstanceNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{relu, tanh};

/// Configuration for the ResNet-style generator.
///
/// ```text
/// (batch, C, H, W)
///   → Conv7x7(C→n) → IN → ReLU
///   → [Conv3x3 stride 2 → IN → ReLU] × 2          (n → 2n → 4n)
///   → ResidualBlock(4n) × n_residual_blocks
///   → [ConvT3x3 stride 2 → IN → ReLU] × 2         (4n → 2n → n)
///   → Conv7x7(n→C) → tanh
///   → (batch, C, H, W) in [-1, 1]
/// ```
///
/// `H` and `W` must be divisible by 4.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    /// Image channels (3 for RGB).
    #[config(default = 3)]
    pub channels: usize,
    /// Filters in the first convolution; doubled at each downsample.
    #[config(default = 64)]
    pub base_filters: usize,
    /// Number of residual blocks at the bottleneck.
    #[config(default = 6)]
    pub n_residual_blocks: usize,
}

/// Convolution followed by instance norm. Activation is applied by the caller.
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: InstanceNorm<B>,
}

impl<B: Backend> ConvNorm<B> {
    pub fn new(
        d_in: usize,
        d_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: Conv2dConfig::new([d_in, d_out], [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .init(device),
            norm: InstanceNormConfig::new(d_out).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }
}

/// Two 3x3 conv-norm layers with an identity skip.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    first: ConvNorm<B>,
    second: ConvNorm<B>,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(d: usize, device: &B::Device) -> Self {
        Self {
            first: ConvNorm::new(d, d, 3, 1, 1, device),
            second: ConvNorm::new(d, d, 3, 1, 1, device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = relu(self.first.forward(x.clone()));
        x + self.second.forward(h)
    }
}

/// Stride-2 transposed convolution doubling the spatial size.
#[derive(Module, Debug)]
pub struct Upsample<B: Backend> {
    conv: ConvTranspose2d<B>,
    norm: InstanceNorm<B>,
}

impl<B: Backend> Upsample<B> {
    fn new(d_in: usize, d_out: usize, device: &B::Device) -> Self {
        Self {
            conv: ConvTranspose2dConfig::new([d_in, d_out], [3, 3])
                .with_stride([2, 2])
                .with_padding([1, 1])
                .with_padding_out([1, 1])
                .init(device),
            norm: InstanceNormConfig::new(d_out).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.norm.forward(self.conv.forward(x)))
    }
}

/// Generator mapping images of one domain to the other.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    stem: ConvNorm<B>,
    down: Vec<ConvNorm<B>>,
    residual: Vec<ResidualBlock<B>>,
    up: Vec<Upsample<B>>,
    head: Conv2d<B>,
}

impl GeneratorConfig {
    /// Initialize a Generator with the given configuration.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let n = self.base_filters;
        Generator {
            stem: ConvNorm::new(self.channels, n, 7, 1, 3, device),
            down: vec![
                ConvNorm::new(n, 2 * n, 3, 2, 1, device),
                ConvNorm::new(2 * n, 4 * n, 3, 2, 1, device),
            ],
            residual: (0..self.n_residual_blocks)
                .map(|_| ResidualBlock::new(4 * n, device))
                .collect(),
            up: vec![Upsample::new(4 * n, 2 * n, device), Upsample::new(2 * n, n, device)],
            head: Conv2dConfig::new([n, self.channels], [7, 7])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .init(device),
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Input and output shape: `(batch, channels, height, width)`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut h = relu(self.stem.forward(x));
        for block in &self.down {
            h = relu(block.forward(h));
        }
        for block in &self.residual {
            h = block.forward(h);
        }
        for block in &self.up {
            h = block.forward(h);
        }
        tanh(self.head.forward(h))
    }
}
