//! TOML configuration loading and override logic.

use std::path::Path;

use cyclegan::model::{DiscriminatorConfig, GeneratorConfig};
use cyclegan::CycleGanConfig;
use faces::AgeThresholds;
use serde::Deserialize;

/// Image side used when neither the TOML nor the CLI sets one.
pub const DEFAULT_IMAGE_SIZE: u32 = 256;

/// Top-level structure matching `configs/aging.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct AgingToml {
    /// Network size overrides.
    #[serde(default)]
    pub model: ModelOverrides,
    /// Dataset overrides.
    #[serde(default)]
    pub data: DataOverrides,
}

/// Optional overrides for the generator and discriminator configs.
#[derive(Debug, Default, Deserialize)]
pub struct ModelOverrides {
    /// Filters in the first generator convolution.
    pub generator_filters: Option<usize>,
    /// Residual blocks at the generator bottleneck.
    pub residual_blocks: Option<usize>,
    /// Filters in the first discriminator convolution.
    pub discriminator_filters: Option<usize>,
    /// Stride-2 convolutions in the discriminator.
    pub discriminator_downsample: Option<usize>,
}

/// Optional overrides for age bucketing and image size.
#[derive(Debug, Default, Deserialize)]
pub struct DataOverrides {
    pub young_min: Option<u32>,
    pub young_max: Option<u32>,
    pub old_min: Option<u32>,
    pub image_size: Option<u32>,
}

/// Resolved dataset settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataSettings {
    pub thresholds: AgeThresholds,
    pub image_size: u32,
}

/// Load and deserialize an `AgingToml` from a TOML file.
pub fn load_aging_toml(path: &Path) -> anyhow::Result<AgingToml> {
    let contents = std::fs::read_to_string(path)?;
    let config: AgingToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded aging config");
    Ok(config)
}

/// Like [`load_aging_toml`], but an absent path yields all-default overrides.
pub fn load_optional_toml(path: Option<&Path>) -> anyhow::Result<AgingToml> {
    match path {
        Some(p) => load_aging_toml(p),
        None => Ok(AgingToml::default()),
    }
}

/// Build the model quartet config from defaults and TOML overrides.
pub fn build_model_config(overrides: &ModelOverrides) -> CycleGanConfig {
    let mut generator = GeneratorConfig::new();
    let mut discriminator = DiscriminatorConfig::new();

    if let Some(n) = overrides.generator_filters {
        generator.base_filters = n;
    }
    if let Some(n) = overrides.residual_blocks {
        generator.n_residual_blocks = n;
    }
    if let Some(n) = overrides.discriminator_filters {
        discriminator.base_filters = n;
    }
    if let Some(n) = overrides.discriminator_downsample {
        discriminator.n_downsample = n;
    }

    CycleGanConfig::new()
        .with_generator(generator)
        .with_discriminator(discriminator)
}

/// Build dataset settings.
///
/// Priority chain: built-in defaults < TOML values < CLI `--image-size`.
pub fn build_data_settings(
    overrides: &DataOverrides,
    image_size_cli: Option<u32>,
) -> anyhow::Result<DataSettings> {
    let mut thresholds = AgeThresholds::default();
    if let Some(n) = overrides.young_min {
        thresholds.young_min = n;
    }
    if let Some(n) = overrides.young_max {
        thresholds.young_max = n;
    }
    if let Some(n) = overrides.old_min {
        thresholds.old_min = n;
    }

    let image_size = image_size_cli
        .or(overrides.image_size)
        .unwrap_or(DEFAULT_IMAGE_SIZE);

    anyhow::ensure!(
        image_size > 0 && image_size % 4 == 0,
        "image size must be a positive multiple of 4, got {image_size}"
    );
    anyhow::ensure!(
        thresholds.young_min <= thresholds.young_max && thresholds.young_max < thresholds.old_min,
        "age thresholds overlap: young {}..={}, old >= {}",
        thresholds.young_min,
        thresholds.young_max,
        thresholds.old_min
    );

    Ok(DataSettings {
        thresholds,
        image_size,
    })
}
