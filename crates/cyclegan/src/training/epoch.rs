//! One epoch: TRAINING over every batch, then EVALUATING on the validation
//! split.

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::tensor::backend::AutodiffBackend;
use faces::{BatchLoader, Split};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;

use crate::model::{Discriminator, Generator, ModelQuartet};
use crate::training::eval::evaluate;
use crate::training::fid::{FeatureExtractor, FidAccumulator};
use crate::training::loss::LossWeights;
use crate::training::metrics::{MetricsRecord, EPOCH_FLOAT_KEY, FID_KEY};
use crate::training::samples::SampleSink;
use crate::training::schedule::ScheduleQuartet;
use crate::training::step::{train_step, OptimizerQuartet};
use crate::training::substrate::{ExecutionContext, Prepared};
use crate::training::tracking::TrackingSink;

/// Everything the run controller owns across epochs.
pub struct TrainState<B: AutodiffBackend, OG, OD> {
    pub models: Prepared<ModelQuartet<B>>,
    pub optimizers: Prepared<OptimizerQuartet<OG, OD>>,
    pub schedules: ScheduleQuartet,
}

/// Per-epoch knobs that stay fixed for the run.
#[derive(Debug, Clone, Copy)]
pub struct EpochSettings {
    pub weights: LossWeights,
    /// Emit training metrics every this many batches (0 disables).
    pub log_every: usize,
    pub max_grad_norm: f64,
}

/// `epoch + (batch_no + 1) / batches`: the x-axis of every training curve.
pub fn epoch_float(epoch: usize, batch_no: usize, batches: usize) -> f64 {
    epoch as f64 + (batch_no + 1) as f64 / batches.max(1) as f64
}

fn progress_bar(len: usize, epoch: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .expect("valid progress bar template")
            .progress_chars("=> "),
    );
    pb.set_message(format!("epoch {epoch}"));
    pb
}

/// Collaborators an epoch needs besides the training state.
pub struct EpochIo<'a, B: AutodiffBackend, E, S> {
    pub ctx: &'a ExecutionContext<B>,
    pub fid: &'a mut FidAccumulator,
    pub extractor: &'a E,
    pub tracker: &'a mut dyn TrackingSink,
    pub samples: &'a mut S,
    pub rng: &'a mut StdRng,
}

/// Train on every batch of `train`, advance the schedules once, then
/// evaluate on `valid` and request samples.
///
/// Returns the updated state and the validation record.
pub fn perform_epoch<B, OG, OD, TL, VL, E, S>(
    epoch: usize,
    state: TrainState<B, OG, OD>,
    train: &mut TL,
    valid: &VL,
    settings: &EpochSettings,
    io: EpochIo<'_, B, E, S>,
) -> anyhow::Result<(TrainState<B, OG, OD>, MetricsRecord)>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B>,
    OD: Optimizer<Discriminator<B>, B>,
    TL: BatchLoader,
    VL: BatchLoader,
    E: FeatureExtractor<B::InnerBackend>,
    S: SampleSink<B::InnerBackend>,
{
    let EpochIo {
        ctx,
        fid,
        extractor,
        tracker,
        samples,
        rng,
    } = io;
    let TrainState {
        mut models,
        mut optimizers,
        mut schedules,
    } = state;

    // TRAINING
    tracing::info!(epoch, "Training");
    train.begin_pass(rng);
    let batches = train.num_batches();
    let lrs = schedules.current();
    let pb = progress_bar(batches, epoch);

    for batch_no in 0..batches {
        let batch = train.load_batch(batch_no, rng)?;
        let (x, y) = ctx.batch(&batch);

        let mut record = MetricsRecord::new();
        models = models.map(|m| {
            let (m, r) = train_step(
                m,
                &mut *optimizers,
                x,
                y,
                &settings.weights,
                &lrs,
                settings.max_grad_norm,
            );
            record = r;
            m
        });

        if settings.log_every > 0 && batch_no % settings.log_every == 0 {
            record.insert_raw(EPOCH_FLOAT_KEY, epoch_float(epoch, batch_no, batches));
            tracing::info!(epoch, batch_no, "{record}");
            tracker.log(&record)?;
        }
        if let Some(total) = record.get(Split::Train, "loss_gen_total") {
            pb.set_message(format!("gen {total:.4}"));
        }
        pb.inc(1);
    }
    pb.finish_with_message("done");

    let lrs = schedules.step();
    let mut lr_record = MetricsRecord::new();
    for (name, lr) in lrs.named() {
        lr_record.insert(Split::Train, name, lr);
    }
    tracing::info!(epoch, lr_g = lrs.g, lr_dx = lrs.dx, "Stepped schedules");
    tracker.log(&lr_record)?;

    // EVALUATING
    tracing::info!(epoch, "Evaluating");
    let eval_models = models.valid();
    let device = ctx.device().clone();
    let val_metrics = evaluate(
        &eval_models,
        valid,
        Split::Valid,
        &settings.weights,
        fid,
        extractor,
        &device,
        rng,
    )?;
    tracing::info!(
        epoch,
        fid = ?val_metrics.get(Split::Valid, FID_KEY),
        "{val_metrics}"
    );
    tracker.log(&val_metrics)?;

    samples.save(epoch, &eval_models.g, valid, &device, rng)?;

    ctx.release_memory();

    let state = TrainState {
        models,
        optimizers,
        schedules,
    };
    Ok((state, val_metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_float() {
        assert!((epoch_float(1, 0, 4) - 1.25).abs() < 1e-12);
        assert!((epoch_float(1, 3, 4) - 2.0).abs() < 1e-12);
        assert!((epoch_float(3, 1, 2) - 4.0).abs() < 1e-12);
    }
}
