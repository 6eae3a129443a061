//! CycleGAN training pipeline: loss assembly, the two-phase optimization
//! step, per-epoch LR schedules, FID evaluation, the epoch orchestrator and
//! the multi-epoch run controller with best-model checkpointing.

use std::path::PathBuf;

use faces::Split;

pub mod checkpoint;
pub mod clip;
pub mod epoch;
pub mod eval;
pub mod fid;
pub mod loss;
pub mod metrics;
pub mod run;
pub mod samples;
pub mod schedule;
pub mod step;
pub mod substrate;
pub mod tracking;

/// Errors from the training core.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    /// An evaluation pass saw no batches; averaging would divide by zero.
    #[error("Split '{0}' produced no batches")]
    EmptySplit(Split),

    /// A metric came out NaN or infinite; the epoch is considered failed.
    #[error("Non-finite metric {key} = {value}")]
    NonFiniteMetric { key: String, value: f64 },

    /// The test phase needs a `best` checkpoint and none was written.
    #[error("No best checkpoint at {0}; refusing to evaluate untrained weights")]
    MissingBestCheckpoint(PathBuf),

    /// Checkpoint could not be encoded, decoded, written or read.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// FID accumulator misuse or degenerate statistics.
    #[error(transparent)]
    Fid(#[from] fid::FidError),

    /// Loader failure.
    #[error(transparent)]
    Data(#[from] faces::DataError),
}
