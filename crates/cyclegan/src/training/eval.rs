//! No-gradient evaluation over a held-out split.
//!
//! Models passed here are expected on a non-autodiff backend (the result of
//! `valid()`), so no graph is recorded and no parameter can change.

use burn::prelude::*;
use faces::{BatchLoader, Split};
use rand::rngs::StdRng;

use crate::model::bridge::{batch_to_tensors, tensor_to_f64};
use crate::model::ModelQuartet;
use crate::training::fid::{FeatureExtractor, FidAccumulator, Stream};
use crate::training::loss::{discriminator_loss, generator_losses, translate, LossWeights};
use crate::training::metrics::{LossValues, MetricsRecord, FID_KEY};
use crate::training::TrainError;

/// Map generator output from `[-1, 1]` to `[0, 1]` for feature extraction.
pub fn to_unit_range<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    images.mul_scalar(0.5).add_scalar(0.5)
}

/// Loss terms and discriminator losses for one batch, without updates.
pub fn evaluate_batch<B: Backend>(
    models: &ModelQuartet<B>,
    x: Tensor<B, 4>,
    y: Tensor<B, 4>,
    weights: &LossWeights,
) -> (LossValues, Tensor<B, 4>) {
    let t = translate(&models.g, &models.f, x.clone(), y.clone());
    let losses = generator_losses(
        &models.g,
        &models.f,
        &models.dx,
        &models.dy,
        x.clone(),
        y.clone(),
        &t,
        weights,
    );
    let loss_dx = discriminator_loss(models.dx.forward(x), models.dx.forward(t.fake_x.clone()));
    let loss_dy = discriminator_loss(models.dy.forward(y), models.dy.forward(t.fake_y.clone()));

    let values = LossValues {
        loss_dx: tensor_to_f64(loss_dx),
        loss_dy: tensor_to_f64(loss_dy),
        f_adv: tensor_to_f64(losses.f_adv),
        g_adv: tensor_to_f64(losses.g_adv),
        cycle: tensor_to_f64(losses.cycle),
        identity: tensor_to_f64(losses.identity),
        gen_total: tensor_to_f64(losses.total),
    };
    (values, t.fake_y)
}

/// Evaluate `models` on every batch of `loader`.
///
/// Losses are averaged over batches. FID compares real old-domain images
/// with `G(x)` and is reported once for the whole split under
/// `"<split>/fid_val"`.
#[allow(clippy::too_many_arguments)]
pub fn evaluate<B, L, E>(
    models: &ModelQuartet<B>,
    loader: &L,
    split: Split,
    weights: &LossWeights,
    fid: &mut FidAccumulator,
    extractor: &E,
    device: &B::Device,
    rng: &mut StdRng,
) -> Result<MetricsRecord, TrainError>
where
    B: Backend,
    L: BatchLoader + ?Sized,
    E: FeatureExtractor<B>,
{
    fid.reset();

    let n_batches = loader.num_batches();
    let mut totals = MetricsRecord::zeroed_losses(split);

    for index in 0..n_batches {
        let batch = loader.load_batch(index, rng)?;
        let (x, y) = batch_to_tensors::<B>(&batch, device);

        let (values, fake_y) = evaluate_batch(models, x, y.clone(), weights);
        totals.accumulate(&values.to_record(split));

        fid.update_images(extractor, to_unit_range(y), Stream::Real)?;
        fid.update_images(extractor, to_unit_range(fake_y), Stream::Generated)?;
    }

    totals.average_over(n_batches, split)?;
    totals.insert(split, FID_KEY, fid.compute()?);
    totals.ensure_finite()?;

    tracing::debug!(split = %split, n_batches, "Evaluation pass complete");
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use faces::InMemoryLoader;
    use rand::SeedableRng;

    use crate::model::{CycleGanConfig, DiscriminatorConfig, GeneratorConfig};
    use crate::training::fid::PooledFeatures;
    use crate::training::metrics::LOSS_KEYS;

    type TestBackend = NdArray<f32>;

    fn tiny_models() -> ModelQuartet<TestBackend> {
        CycleGanConfig::new()
            .with_generator(
                GeneratorConfig::new()
                    .with_base_filters(2)
                    .with_n_residual_blocks(1),
            )
            .with_discriminator(
                DiscriminatorConfig::new()
                    .with_base_filters(2)
                    .with_n_downsample(2),
            )
            .init(&Default::default())
    }

    fn image(seed: usize) -> Vec<f32> {
        (0..3 * 8 * 8)
            .map(|i| (((i * 31 + seed * 17) % 97) as f32 / 48.5) - 1.0)
            .collect()
    }

    fn loader(n: usize, batch_size: usize) -> InMemoryLoader {
        let young: Vec<Vec<f32>> = (0..n).map(image).collect();
        let old: Vec<Vec<f32>> = (0..n).map(|i| image(i + 100)).collect();
        InMemoryLoader::from_images(&young, &old, [3, 8, 8], batch_size).unwrap()
    }

    #[test]
    fn test_evaluate_reports_all_keys() {
        let models = tiny_models();
        let loader = loader(4, 2);
        let extractor = PooledFeatures::new(3, 2);
        let mut fid = FidAccumulator::new(12);
        let mut rng = StdRng::seed_from_u64(0);

        let metrics = evaluate(
            &models,
            &loader,
            Split::Valid,
            &LossWeights::new(),
            &mut fid,
            &extractor,
            &Default::default(),
            &mut rng,
        )
        .unwrap();

        assert_eq!(metrics.len(), LOSS_KEYS.len() + 1);
        for key in LOSS_KEYS {
            assert!(metrics.get(Split::Valid, key).is_some(), "missing val/{key}");
        }
        assert!(metrics.get_raw("val/fid_val").unwrap() >= 0.0);
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let models = tiny_models();
        let loader = loader(4, 2);
        let extractor = PooledFeatures::new(3, 2);
        let mut fid = FidAccumulator::new(12);
        let weights = LossWeights::new();

        let mut run = || {
            let mut rng = StdRng::seed_from_u64(0);
            evaluate(
                &models,
                &loader,
                Split::Test,
                &weights,
                &mut fid,
                &extractor,
                &Default::default(),
                &mut rng,
            )
            .unwrap()
        };
        let first = run();
        let second = run();

        for (key, a) in first.iter() {
            let b = second.get_raw(key).unwrap();
            assert!((a - b).abs() <= 1e-6 * a.abs().max(1.0), "{key}: {a} vs {b}");
        }
    }

    #[test]
    fn test_evaluate_averages_losses_over_batches() {
        let models = tiny_models();
        let weights = LossWeights::new();
        let extractor = PooledFeatures::new(3, 2);
        let loader = loader(4, 2);
        let mut rng = StdRng::seed_from_u64(0);
        let device = Default::default();

        let mut expected = 0.0;
        for index in 0..loader.num_batches() {
            let batch = loader.load_batch(index, &mut rng).unwrap();
            let (x, y) = batch_to_tensors::<TestBackend>(&batch, &device);
            expected += evaluate_batch(&models, x, y, &weights).0.cycle;
        }
        expected /= loader.num_batches() as f64;

        let mut fid = FidAccumulator::new(12);
        let metrics = evaluate(
            &models,
            &loader,
            Split::Valid,
            &weights,
            &mut fid,
            &extractor,
            &device,
            &mut rng,
        )
        .unwrap();
        let got = metrics.get(Split::Valid, "loss_cyc").unwrap();
        assert!((got - expected).abs() < 1e-6, "expected {expected}, got {got}");
    }

    #[test]
    fn test_empty_split_is_an_error() {
        let models = tiny_models();
        let loader = InMemoryLoader::new(Vec::new());
        let extractor = PooledFeatures::new(3, 2);
        let mut fid = FidAccumulator::new(12);
        let mut rng = StdRng::seed_from_u64(0);

        let err = evaluate(
            &models,
            &loader,
            Split::Test,
            &LossWeights::new(),
            &mut fid,
            &extractor,
            &Default::default(),
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, TrainError::EmptySplit(Split::Test)));
    }
}
