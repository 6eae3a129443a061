//! CycleGAN model components: ResNet-style generator, PatchGAN-style
//! discriminator, the four-model quartet, and the tensor bridge between
//! loader buffers and burn tensors.

pub mod bridge;
pub mod discriminator;
pub mod generator;
pub mod quartet;

pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use generator::{Generator, GeneratorConfig};
pub use quartet::{CycleGanConfig, ModelQuartet};
