//! Rotating `best` / `current` checkpoints.
//!
//! A checkpoint is a single bincode file holding the four model records, the
//! four optimizer records (both as named-MessagePack bytes from burn's
//! recorder) and the four schedule states. Every save is a full overwrite
//! through a temporary sibling and a rename.

use std::path::{Path, PathBuf};

use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::model::{CycleGanConfig, Discriminator, Generator, ModelQuartet};
use crate::training::schedule::ScheduleQuartet;
use crate::training::step::OptimizerQuartet;
use crate::training::TrainError;

type BytesRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Which rotating slot to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Overwritten whenever validation FID improves.
    Best,
    /// Overwritten every `checkpoint_every` epochs.
    Current,
}

impl CheckpointKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            CheckpointKind::Best => "best.ckpt",
            CheckpointKind::Current => "current.ckpt",
        }
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

/// On-disk checkpoint layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub epoch: usize,
    #[serde(rename = "G")]
    pub g: Vec<u8>,
    #[serde(rename = "F")]
    pub f: Vec<u8>,
    #[serde(rename = "DX")]
    pub dx: Vec<u8>,
    #[serde(rename = "DY")]
    pub dy: Vec<u8>,
    #[serde(rename = "opt_G")]
    pub opt_g: Vec<u8>,
    #[serde(rename = "opt_F")]
    pub opt_f: Vec<u8>,
    #[serde(rename = "opt_DX")]
    pub opt_dx: Vec<u8>,
    #[serde(rename = "opt_DY")]
    pub opt_dy: Vec<u8>,
    pub schedules: ScheduleQuartet,
}

fn ckpt_err(what: &str, e: impl std::fmt::Display) -> TrainError {
    TrainError::Checkpoint(format!("{what}: {e}"))
}

fn record_bytes<B: Backend, R: burn::record::Record<B>>(
    record: R,
    what: &str,
) -> Result<Vec<u8>, TrainError> {
    Recorder::<B>::record(&BytesRecorder::default(), record, ()).map_err(|e| ckpt_err(what, e))
}

fn module_bytes<B: Backend, M: Module<B>>(module: &M, what: &str) -> Result<Vec<u8>, TrainError> {
    record_bytes::<B, _>(module.clone().into_record(), what)
}

fn load_record<B: Backend, R: burn::record::Record<B>>(
    bytes: &[u8],
    device: &B::Device,
    what: &str,
) -> Result<R, TrainError> {
    Recorder::<B>::load(&BytesRecorder::default(), bytes.to_vec(), device)
        .map_err(|e| ckpt_err(what, e))
}

fn load_module<B: Backend, M: Module<B>>(
    module: M,
    bytes: &[u8],
    device: &B::Device,
    what: &str,
) -> Result<M, TrainError> {
    Ok(module.load_record(load_record::<B, _>(bytes, device, what)?))
}

impl CheckpointFile {
    /// Snapshot the full training state.
    pub fn capture<B, OG, OD>(
        epoch: usize,
        models: &ModelQuartet<B>,
        optimizers: &OptimizerQuartet<OG, OD>,
        schedules: &ScheduleQuartet,
    ) -> Result<Self, TrainError>
    where
        B: AutodiffBackend,
        OG: Optimizer<Generator<B>, B>,
        OD: Optimizer<Discriminator<B>, B>,
    {
        Ok(Self {
            epoch,
            g: module_bytes::<B, _>(&models.g, "G")?,
            f: module_bytes::<B, _>(&models.f, "F")?,
            dx: module_bytes::<B, _>(&models.dx, "DX")?,
            dy: module_bytes::<B, _>(&models.dy, "DY")?,
            opt_g: record_bytes::<B, _>(optimizers.g.to_record(), "opt_G")?,
            opt_f: record_bytes::<B, _>(optimizers.f.to_record(), "opt_F")?,
            opt_dx: record_bytes::<B, _>(optimizers.dx.to_record(), "opt_DX")?,
            opt_dy: record_bytes::<B, _>(optimizers.dy.to_record(), "opt_DY")?,
            schedules: schedules.clone(),
        })
    }

    /// Write atomically to `path`.
    pub fn write(&self, path: &Path) -> Result<(), TrainError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ckpt_err(&parent.display().to_string(), e))?;
        }
        let bytes = bincode::serialize(self).map_err(|e| ckpt_err("encode", e))?;
        let tmp = path.with_extension("ckpt.tmp");
        std::fs::write(&tmp, bytes).map_err(|e| ckpt_err(&tmp.display().to_string(), e))?;
        std::fs::rename(&tmp, path).map_err(|e| ckpt_err(&path.display().to_string(), e))?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, TrainError> {
        let bytes = std::fs::read(path).map_err(|e| ckpt_err(&path.display().to_string(), e))?;
        bincode::deserialize(&bytes).map_err(|e| ckpt_err(&path.display().to_string(), e))
    }

    /// Load the four parameter sets into `models`. Optimizer and schedule
    /// state are left untouched.
    pub fn load_params<B: Backend>(
        &self,
        models: ModelQuartet<B>,
        device: &B::Device,
    ) -> Result<ModelQuartet<B>, TrainError> {
        Ok(ModelQuartet {
            g: load_module(models.g, &self.g, device, "G")?,
            f: load_module(models.f, &self.f, device, "F")?,
            dx: load_module(models.dx, &self.dx, device, "DX")?,
            dy: load_module(models.dy, &self.dy, device, "DY")?,
        })
    }

    /// Restore optimizer state into freshly built optimizers.
    pub fn load_optimizers<B, OG, OD>(
        &self,
        optimizers: OptimizerQuartet<OG, OD>,
        device: &B::Device,
    ) -> Result<OptimizerQuartet<OG, OD>, TrainError>
    where
        B: AutodiffBackend,
        OG: Optimizer<Generator<B>, B>,
        OD: Optimizer<Discriminator<B>, B>,
    {
        Ok(OptimizerQuartet {
            g: optimizers.g.load_record(load_record::<B, _>(&self.opt_g, device, "opt_G")?),
            f: optimizers.f.load_record(load_record::<B, _>(&self.opt_f, device, "opt_F")?),
            dx: optimizers.dx.load_record(load_record::<B, _>(&self.opt_dx, device, "opt_DX")?),
            dy: optimizers.dy.load_record(load_record::<B, _>(&self.opt_dy, device, "opt_DY")?),
        })
    }
}

/// Snapshot and write one checkpoint slot under `dir`. Returns its path.
pub fn save_checkpoint<B, OG, OD>(
    dir: &Path,
    kind: CheckpointKind,
    epoch: usize,
    models: &ModelQuartet<B>,
    optimizers: &OptimizerQuartet<OG, OD>,
    schedules: &ScheduleQuartet,
) -> Result<PathBuf, TrainError>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B>,
    OD: Optimizer<Discriminator<B>, B>,
{
    let path = kind.path_in(dir);
    CheckpointFile::capture(epoch, models, optimizers, schedules)?.write(&path)?;
    tracing::info!(epoch, path = %path.display(), "Checkpoint saved");
    Ok(path)
}

/// Fresh models from `config` with the parameters of `dir/best.ckpt`.
///
/// Fails with [`TrainError::MissingBestCheckpoint`] when no best checkpoint
/// was ever written.
pub fn load_best_params<B: Backend>(
    dir: &Path,
    config: &CycleGanConfig,
    device: &B::Device,
) -> Result<(ModelQuartet<B>, usize), TrainError> {
    let path = CheckpointKind::Best.path_in(dir);
    if !path.is_file() {
        return Err(TrainError::MissingBestCheckpoint(path));
    }
    let file = CheckpointFile::read(&path)?;
    let models = file.load_params(config.init::<B>(device), device)?;
    tracing::info!(epoch = file.epoch, path = %path.display(), "Loaded best parameters");
    Ok((models, file.epoch))
}

/// Best-so-far validation FID across a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestTracker {
    pub best: f64,
    pub epoch: Option<usize>,
}

impl Default for BestTracker {
    fn default() -> Self {
        Self {
            best: f64::INFINITY,
            epoch: None,
        }
    }
}

impl BestTracker {
    /// Record `fid` for `epoch`; true if it strictly improves on the best.
    pub fn observe(&mut self, epoch: usize, fid: f64) -> bool {
        if fid < self.best {
            self.best = fid;
            self.epoch = Some(epoch);
            true
        } else {
            false
        }
    }
}
