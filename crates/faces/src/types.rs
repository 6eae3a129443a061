use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors raised while indexing or loading face images.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// The dataset directory contains no JPG files.
    #[error("No UTKFace JPG files found in {0}. Did you unzip the dataset into that folder?")]
    NoImages(PathBuf),

    /// One of the two age domains has no images after thresholding.
    #[error("Age thresholds left one domain empty (young={young}, old={old}); adjust young_max/old_min")]
    EmptyDomain { young: usize, old: usize },

    /// An image file could not be opened or decoded.
    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Buffers do not match the declared batch shape.
    #[error("Batch shape mismatch: {0}")]
    Shape(String),

    /// Requested a batch past the end of the pass.
    #[error("Batch index {index} out of range ({len} batches)")]
    OutOfRange { index: usize, len: usize },

    /// IO error while scanning the dataset directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Dataset partition. Also names the metric namespace for that partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    /// Metric namespace prefix: `train`, `val` or `test`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two translation domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgeDomain {
    /// Domain A.
    Young,
    /// Domain B.
    Old,
}

/// Age bucket boundaries (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgeThresholds {
    #[serde(default = "default_young_min")]
    pub young_min: u32,
    #[serde(default = "default_young_max")]
    pub young_max: u32,
    #[serde(default = "default_old_min")]
    pub old_min: u32,
}

fn default_young_min() -> u32 {
    18
}
fn default_young_max() -> u32 {
    28
}
fn default_old_min() -> u32 {
    40
}

impl Default for AgeThresholds {
    fn default() -> Self {
        Self {
            young_min: default_young_min(),
            young_max: default_young_max(),
            old_min: default_old_min(),
        }
    }
}

impl AgeThresholds {
    /// Bucket an age, or `None` if it falls between the two domains.
    pub fn classify(&self, age: u32) -> Option<AgeDomain> {
        if (self.young_min..=self.young_max).contains(&age) {
            Some(AgeDomain::Young)
        } else if age >= self.old_min {
            Some(AgeDomain::Old)
        } else {
            None
        }
    }
}

/// A face image on disk with its labelled age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceRecord {
    pub path: PathBuf,
    pub age: u32,
}

impl FaceRecord {
    /// Parse the age from a UTKFace filename (`<age>_<gender>_<race>_<date>.jpg`).
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let age = name.split('_').next()?.parse().ok()?;
        Some(Self {
            path: path.to_path_buf(),
            age,
        })
    }
}

/// One unpaired batch: `x` from the young domain, `y` from the old domain.
///
/// Both buffers are flat `[batch, channels, height, width]` in row-major order.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub batch_size: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageBatch {
    /// Build a batch, checking both buffers against the declared shape.
    pub fn new(
        x: Vec<f32>,
        y: Vec<f32>,
        batch_size: usize,
        channels: usize,
        height: usize,
        width: usize,
    ) -> Result<Self, DataError> {
        let expected = batch_size * channels * height * width;
        if batch_size == 0 || expected == 0 {
            return Err(DataError::Shape(format!(
                "empty shape [{batch_size}, {channels}, {height}, {width}]"
            )));
        }
        if x.len() != expected || y.len() != expected {
            return Err(DataError::Shape(format!(
                "x has {} values, y has {}, expected {expected} for [{batch_size}, {channels}, {height}, {width}]",
                x.len(),
                y.len()
            )));
        }
        Ok(Self {
            x,
            y,
            batch_size,
            channels,
            height,
            width,
        })
    }

    pub fn shape(&self) -> [usize; 4] {
        [self.batch_size, self.channels, self.height, self.width]
    }
}
