//! UTKFace data pipeline for unpaired young/old translation.
//!
//! Scans the dataset directory, buckets faces by age, splits each bucket
//! deterministically into train/valid/test, and serves unpaired `(x, y)`
//! batches as flat CHW `f32` buffers normalised to `[-1, 1]`.

pub mod loader;
pub mod reader;
pub mod transform;
pub mod types;

pub use loader::{BatchLoader, InMemoryLoader, UnpairedLoader};
pub use reader::{split_indices, FaceIndex, SplitIndices, UnpairedSplit, UTKFACE_SUBDIR};
pub use transform::ImageTransform;
pub use types::{AgeDomain, AgeThresholds, DataError, FaceRecord, ImageBatch, Split};
