//! Multi-epoch run controller.
//!
//! Owns the model, optimizer and schedule quartets for the whole run, tracks
//! the best validation FID, rotates checkpoints, runs the optional final
//! test pass against `best.ckpt`, and hands off to the archival and
//! termination collaborators.

use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use faces::{BatchLoader, Split};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::model::{CycleGanConfig, ModelQuartet};
use crate::training::checkpoint::{
    load_best_params, save_checkpoint, BestTracker, CheckpointKind,
};
use crate::training::epoch::{perform_epoch, EpochIo, EpochSettings, TrainState};
use crate::training::eval::evaluate;
use crate::training::fid::{FeatureExtractor, FidAccumulator};
use crate::training::loss::LossWeights;
use crate::training::metrics::{MetricsRecord, EPOCH_FLOAT_KEY, FID_KEY};
use crate::training::samples::SampleSink;
use crate::training::schedule::ScheduleQuartet;
use crate::training::step::OptimizerConfig;
use crate::training::substrate::ExecutionContext;
use crate::training::tracking::TrackingSink;
use crate::training::TrainError;

/// Hyperparameters and switches for one training run.
#[derive(Config, Debug)]
pub struct RunConfig {
    /// Initial learning rate for G and F.
    #[config(default = 2e-4)]
    pub gen_lr: f64,
    /// Initial learning rate for DX and DY.
    #[config(default = 1e-4)]
    pub disc_lr: f64,
    #[config(default = 100)]
    pub num_train_epochs: usize,
    #[config(default = 16)]
    pub train_batch_size: usize,
    #[config(default = 32)]
    pub eval_batch_size: usize,
    #[config(default = 2.0)]
    pub lambda_adv: f64,
    #[config(default = 4.0)]
    pub lambda_cyc: f64,
    #[config(default = 0.5)]
    pub lambda_id: f64,
    /// L2 penalty for all four Adam optimizers.
    #[config(default = 1e-4)]
    pub weight_decay: f64,
    /// Seed the backend and the data RNG for a reproducible run.
    #[config(default = false)]
    pub set_seed: bool,
    /// Seed for the run RNG (when `set_seed`) and always for the data split.
    #[config(default = 42)]
    pub seed: u64,
    /// Emit training metrics every this many batches.
    #[config(default = 50)]
    pub steps_for_logging_metrics: usize,
    #[config(default = 10)]
    pub num_sample_generations_to_save: usize,
    /// Decoder threads for the loaders.
    #[config(default = 3)]
    pub num_workers: usize,
    /// Evaluate `best.ckpt` on the test split after training.
    #[config(default = true)]
    pub do_test: bool,
    /// Sync outputs to S3 after each checkpoint and terminate the instance at the end.
    #[config(default = false)]
    pub archive_and_terminate_ec2: bool,
    #[config(default = "String::from(\"aging-gan\")")]
    pub s3_bucket_name: String,
    #[config(default = "String::from(\"outputs\")")]
    pub output_dir: String,
    /// Write `current.ckpt` every this many epochs.
    #[config(default = 5)]
    pub checkpoint_every: usize,
    #[config(default = 1.0)]
    pub max_grad_norm: f64,
    #[config(default = "CycleGanConfig::new()")]
    pub model: CycleGanConfig,
}

impl RunConfig {
    pub fn loss_weights(&self) -> LossWeights {
        LossWeights::new()
            .with_adversarial(self.lambda_adv)
            .with_cycle(self.lambda_cyc)
            .with_identity(self.lambda_id)
    }

    pub fn optimizer(&self) -> OptimizerConfig {
        OptimizerConfig::new().with_weight_decay(self.weight_decay as f32)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        Path::new(&self.output_dir).join("checkpoints")
    }

    pub fn samples_dir(&self) -> PathBuf {
        Path::new(&self.output_dir).join("samples")
    }

    pub fn test_metrics_path(&self) -> PathBuf {
        Path::new(&self.output_dir).join("metrics").join("test_metrics.json")
    }
}

/// Process-wide state derived once from a [`RunConfig`].
#[derive(Debug)]
pub struct RunEnvironment {
    /// Drives shuffling, augmentation and evaluation batch decoding.
    pub rng: StdRng,
    /// 8-hex-digit identifier used for the archive prefix.
    pub run_name: String,
}

impl RunEnvironment {
    pub fn archive_prefix(&self) -> String {
        format!("outputs/run-{}", self.run_name)
    }
}

/// Seed the backend and the run RNG. Call exactly once at process start.
pub fn initialize_environment<B: Backend>(config: &RunConfig) -> RunEnvironment {
    let rng = if config.set_seed {
        B::seed(config.seed);
        tracing::info!(seed = config.seed, "Set seed");
        StdRng::seed_from_u64(config.seed)
    } else {
        tracing::info!("Skipping setting seed");
        StdRng::from_entropy()
    };
    let run_name = format!("{:08x}", rand::thread_rng().gen::<u32>());
    tracing::info!(run_name, "Initialized run environment");
    RunEnvironment { rng, run_name }
}

/// Uploads the output directory to object storage.
pub trait Archiver {
    fn archive(&self, bucket: &str, prefix: &str, dir: &Path) -> anyhow::Result<()>;
}

/// Shuts down the compute instance at the end of a run.
pub trait Terminator {
    fn terminate(&self) -> anyhow::Result<()>;
}

/// Train, validation and test loaders, built before any model exists.
pub struct RunData<TL, VL, SL> {
    pub train: TL,
    pub valid: VL,
    pub test: SL,
}

/// External collaborators of a run.
pub struct RunHooks<'a, S> {
    pub tracker: &'a mut dyn TrackingSink,
    pub samples: &'a mut S,
    pub archiver: Option<&'a dyn Archiver>,
    pub terminator: Option<&'a dyn Terminator>,
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_name: String,
    pub epochs: usize,
    pub best_fid: Option<f64>,
    pub best_epoch: Option<usize>,
    pub test_metrics: Option<MetricsRecord>,
    pub checkpoint_dir: PathBuf,
}

fn archive_outputs(
    config: &RunConfig,
    env: &RunEnvironment,
    archiver: Option<&dyn Archiver>,
) -> anyhow::Result<()> {
    if !config.archive_and_terminate_ec2 {
        return Ok(());
    }
    let archiver = archiver.context("Archiving enabled but no archiver configured")?;
    let prefix = env.archive_prefix();
    archiver
        .archive(&config.s3_bucket_name, &prefix, Path::new(&config.output_dir))
        .with_context(|| {
            format!(
                "Failed to archive outputs to s3://{}/{prefix}",
                config.s3_bucket_name
            )
        })
}

/// Write `record` as JSON indented by four spaces.
pub fn write_test_metrics(path: &Path, record: &MetricsRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut json = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    record.serialize(&mut serde_json::Serializer::with_formatter(&mut json, formatter))?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "Saved test metrics");
    Ok(())
}

/// Evaluate the parameters of `checkpoint_dir/best.ckpt` on `loader`.
///
/// Only model parameters are restored. Fails fast if no best checkpoint
/// exists.
#[allow(clippy::too_many_arguments)]
pub fn test_best<B, L, E>(
    model_config: &CycleGanConfig,
    checkpoint_dir: &Path,
    loader: &L,
    weights: &LossWeights,
    extractor: &E,
    fid: &mut FidAccumulator,
    device: &B::Device,
    rng: &mut StdRng,
) -> anyhow::Result<(MetricsRecord, usize)>
where
    B: Backend,
    L: BatchLoader + ?Sized,
    E: FeatureExtractor<B>,
{
    let (models, epoch): (ModelQuartet<B>, usize) =
        load_best_params(checkpoint_dir, model_config, device)?;
    let metrics = evaluate(&models, loader, Split::Test, weights, fid, extractor, device, rng)?;
    Ok((metrics, epoch))
}

/// Run the full lifecycle: train and validate for `num_train_epochs`,
/// checkpoint, optionally test, archive and terminate.
pub fn run<B, TL, VL, SL, E, S>(
    config: &RunConfig,
    env: &mut RunEnvironment,
    data: RunData<TL, VL, SL>,
    extractor: &E,
    hooks: RunHooks<'_, S>,
    device: B::Device,
) -> anyhow::Result<RunOutcome>
where
    B: AutodiffBackend,
    TL: BatchLoader,
    VL: BatchLoader,
    SL: BatchLoader,
    E: FeatureExtractor<B::InnerBackend>,
    S: SampleSink<B::InnerBackend>,
{
    let RunHooks {
        tracker,
        samples,
        archiver,
        terminator,
    } = hooks;
    if config.archive_and_terminate_ec2 {
        if archiver.is_none() {
            anyhow::bail!("archive_and_terminate_ec2 is set but no archiver was provided");
        }
        if terminator.is_none() {
            anyhow::bail!("archive_and_terminate_ec2 is set but no terminator was provided");
        }
    }

    tracker.define_step_metric(EPOCH_FLOAT_KEY, &["train/*", "val/*", "test/*"])?;

    let RunData {
        mut train,
        valid,
        test,
    } = data;

    let ctx = ExecutionContext::<B>::new(device);
    let models = config.model.init::<B>(ctx.device());
    let optimizers = config.optimizer().init::<B>();

    let models = ctx.prepare_models(models);
    let optimizers = ctx.prepare_optimizers(optimizers);
    let weights = config.loss_weights();
    let schedules = ScheduleQuartet::for_optimizers(
        &optimizers,
        config.gen_lr,
        config.disc_lr,
        config.num_train_epochs,
    );
    let mut fid = FidAccumulator::new(extractor.dim());

    tracing::info!(
        epochs = config.num_train_epochs,
        params = models.num_params(),
        train_batches = train.num_batches(),
        valid_batches = valid.num_batches(),
        "Starting training"
    );

    let settings = EpochSettings {
        weights,
        log_every: config.steps_for_logging_metrics,
        max_grad_norm: config.max_grad_norm,
    };
    let checkpoint_dir = config.checkpoint_dir();
    let mut best = BestTracker::default();
    let mut state = TrainState {
        models,
        optimizers,
        schedules,
    };

    for epoch in 1..=config.num_train_epochs {
        tracing::info!(epoch, "Epoch");
        let io = EpochIo {
            ctx: &ctx,
            fid: &mut fid,
            extractor,
            tracker: &mut *tracker,
            samples: &mut *samples,
            rng: &mut env.rng,
        };
        let (next, val_metrics) = perform_epoch(epoch, state, &mut train, &valid, &settings, io)
            .with_context(|| format!("Epoch {epoch} failed"))?;
        state = next;

        let val_fid = val_metrics
            .get(Split::Valid, FID_KEY)
            .context("Validation record has no FID")?;

        if best.observe(epoch, val_fid) {
            tracing::info!(epoch, fid = val_fid, "New best validation FID");
            save_checkpoint(
                &checkpoint_dir,
                CheckpointKind::Best,
                epoch,
                &*state.models,
                &*state.optimizers,
                &state.schedules,
            )?;
            archive_outputs(config, env, archiver)?;
        }
        if config.checkpoint_every > 0 && epoch % config.checkpoint_every == 0 {
            save_checkpoint(
                &checkpoint_dir,
                CheckpointKind::Current,
                epoch,
                &*state.models,
                &*state.optimizers,
                &state.schedules,
            )?;
            archive_outputs(config, env, archiver)?;
        }
    }

    let test_metrics = if config.do_test {
        // A best.ckpt left over from an earlier run in the same directory is not ours.
        if best.epoch.is_none() {
            return Err(TrainError::MissingBestCheckpoint(
                CheckpointKind::Best.path_in(&checkpoint_dir),
            )
            .into());
        }
        tracing::info!("Running final test-set evaluation on best checkpoint");
        let (metrics, epoch) = test_best::<B::InnerBackend, _, _>(
            &config.model,
            &checkpoint_dir,
            &test,
            &weights,
            extractor,
            &mut fid,
            ctx.device(),
            &mut env.rng,
        )?;
        tracing::info!(best_epoch = epoch, "Test metrics: {metrics}");
        tracker.log(&metrics)?;
        write_test_metrics(&config.test_metrics_path(), &metrics)?;
        archive_outputs(config, env, archiver)?;
        Some(metrics)
    } else {
        None
    };

    if let (true, Some(terminator)) = (config.archive_and_terminate_ec2, terminator) {
        terminator.terminate().context("Failed to terminate instance")?;
    }

    Ok(RunOutcome {
        run_name: env.run_name.clone(),
        epochs: config.num_train_epochs,
        best_fid: best.epoch.map(|_| best.best),
        best_epoch: best.epoch,
        test_metrics,
        checkpoint_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use rand::RngCore;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_run_config_defaults() {
        let config = RunConfig::new();
        assert_eq!(config.gen_lr, 2e-4);
        assert_eq!(config.disc_lr, 1e-4);
        assert_eq!(config.num_train_epochs, 100);
        assert_eq!(config.checkpoint_every, 5);
        assert_eq!(config.max_grad_norm, 1.0);
        assert!(config.do_test);
        assert!(!config.archive_and_terminate_ec2);

        let w = config.loss_weights();
        assert_eq!((w.adversarial, w.cycle, w.identity), (2.0, 4.0, 0.5));
        assert_eq!(
            config.test_metrics_path(),
            Path::new("outputs").join("metrics").join("test_metrics.json")
        );
    }

    #[test]
    fn test_seeded_environment_is_reproducible() {
        let config = RunConfig::new().with_set_seed(true).with_seed(7);
        let mut a = initialize_environment::<TestBackend>(&config);
        let mut b = initialize_environment::<TestBackend>(&config);
        assert_eq!(a.rng.next_u64(), b.rng.next_u64());
        assert_eq!(a.run_name.len(), 8);
        assert!(a.run_name.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(a.archive_prefix().starts_with("outputs/run-"));
    }

    #[test]
    fn test_write_test_metrics_is_indented() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("metrics").join("test_metrics.json");
        let mut record = MetricsRecord::new();
        record.insert(Split::Test, "fid_val", 3.5);
        record.insert(Split::Test, "loss_DX", 0.25);

        write_test_metrics(&path, &record).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n    \"test/fid_val\": 3.5"));
        let back: MetricsRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_archive_disabled_is_noop() {
        struct Failing;
        impl Archiver for Failing {
            fn archive(&self, _: &str, _: &str, _: &Path) -> anyhow::Result<()> {
                anyhow::bail!("should not be called")
            }
        }
        let config = RunConfig::new();
        let env = initialize_environment::<TestBackend>(&config);
        let failing: &dyn Archiver = &Failing;
        archive_outputs(&config, &env, Some(failing)).unwrap();

        let enabled = RunConfig::new().with_archive_and_terminate_ec2(true);
        assert!(archive_outputs(&enabled, &env, Some(failing)).is_err());
        assert!(archive_outputs(&enabled, &env, None).is_err());
    }
}
