use burn::prelude::*;

use crate::model::discriminator::{Discriminator, DiscriminatorConfig};
use crate::model::generator::{Generator, GeneratorConfig};

/// Architecture of all four networks.
///
/// G and F share the generator configuration, DX and DY the discriminator
/// configuration; each network still gets its own independently initialised
/// parameters.
#[derive(Config, Debug)]
pub struct CycleGanConfig {
    #[config(default = "GeneratorConfig::new()")]
    pub generator: GeneratorConfig,
    #[config(default = "DiscriminatorConfig::new()")]
    pub discriminator: DiscriminatorConfig,
}

impl CycleGanConfig {
    /// Initialize a ModelQuartet with the given configuration.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ModelQuartet<B> {
        ModelQuartet {
            g: self.generator.init(device),
            f: self.generator.init(device),
            dx: self.discriminator.init(device),
            dy: self.discriminator.init(device),
        }
    }
}

/// The four networks of a CycleGAN. None share weights.
#[derive(Module, Debug)]
pub struct ModelQuartet<B: Backend> {
    /// Generator G: young (A) → old (B).
    pub g: Generator<B>,
    /// Generator F: old (B) → young (A).
    pub f: Generator<B>,
    /// Discriminator DX: realism of young-domain images.
    pub dx: Discriminator<B>,
    /// Discriminator DY: realism of old-domain images.
    pub dy: Discriminator<B>,
}
