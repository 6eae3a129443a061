//! One optimization step over an unpaired batch.
//!
//! Phase order is fixed: generators first (using the discriminators as they
//! were before this step), then DX, then DY. Each phase owns the
//! `Gradients` produced by its own `backward()` call, so nothing carries
//! over between phases and no explicit zeroing is needed.

use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use faces::Split;

use crate::model::bridge::tensor_to_f64;
use crate::model::{Discriminator, Generator, ModelQuartet};
use crate::training::clip::clip_global_norm;
use crate::training::loss::{discriminator_loss, generator_losses, translate, LossWeights};
use crate::training::metrics::{LossValues, MetricsRecord};
use crate::training::schedule::LearningRates;

/// Adam hyperparameters shared by all four optimizers.
#[derive(Config, Debug)]
pub struct OptimizerConfig {
    #[config(default = 0.5)]
    pub beta_1: f32,
    #[config(default = 0.999)]
    pub beta_2: f32,
    /// L2 penalty added to the gradients.
    #[config(default = 1e-4)]
    pub weight_decay: f32,
}

impl OptimizerConfig {
    fn adam(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.beta_1)
            .with_beta_2(self.beta_2)
            .with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay)))
    }

    /// One fresh Adam optimizer per network.
    pub fn init<B: AutodiffBackend>(
        &self,
    ) -> OptimizerQuartet<impl Optimizer<Generator<B>, B>, impl Optimizer<Discriminator<B>, B>> {
        let adam = self.adam();
        OptimizerQuartet {
            g: adam.init::<B, Generator<B>>(),
            f: adam.init::<B, Generator<B>>(),
            dx: adam.init::<B, Discriminator<B>>(),
            dy: adam.init::<B, Discriminator<B>>(),
        }
    }
}

/// One optimizer per network; each owns its moment estimates.
pub struct OptimizerQuartet<OG, OD> {
    pub g: OG,
    pub f: OG,
    pub dx: OD,
    pub dy: OD,
}

/// Scalar generator-phase results plus the synthetic images the
/// discriminator phase consumes.
pub struct GeneratorPhase<B: Backend> {
    pub fake_x: Tensor<B, 4>,
    pub fake_y: Tensor<B, 4>,
    pub g_adv: f64,
    pub f_adv: f64,
    pub cycle: f64,
    pub identity: f64,
    pub total: f64,
    /// Joint G+F gradient norm before clipping.
    pub grad_norm: f64,
}

/// Update G and F against the current discriminators.
///
/// DX and DY are only read; their gradients from this backward pass are
/// dropped with the `Gradients` value.
#[allow(clippy::too_many_arguments)]
pub fn generator_phase<B, OG>(
    g: Generator<B>,
    f: Generator<B>,
    dx: &Discriminator<B>,
    dy: &Discriminator<B>,
    optim_g: &mut OG,
    optim_f: &mut OG,
    x: Tensor<B, 4>,
    y: Tensor<B, 4>,
    weights: &LossWeights,
    lr_g: f64,
    lr_f: f64,
    max_grad_norm: f64,
) -> (Generator<B>, Generator<B>, GeneratorPhase<B>)
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B>,
{
    let t = translate(&g, &f, x.clone(), y.clone());
    let losses = generator_losses(&g, &f, dx, dy, x, y, &t, weights);

    let g_adv = tensor_to_f64(losses.g_adv.clone());
    let f_adv = tensor_to_f64(losses.f_adv.clone());
    let cycle = tensor_to_f64(losses.cycle.clone());
    let identity = tensor_to_f64(losses.identity.clone());
    let total = tensor_to_f64(losses.total.clone());

    let mut grads = losses.total.backward();
    let mut grads_g = GradientsParams::from_module(&mut grads, &g);
    let mut grads_f = GradientsParams::from_module(&mut grads, &f);
    drop(grads);

    let grad_norm = clip_global_norm(&mut [(&g, &mut grads_g), (&f, &mut grads_f)], max_grad_norm);

    let g = optim_g.step(lr_g, g, grads_g);
    let f = optim_f.step(lr_f, f, grads_f);

    let phase = GeneratorPhase {
        fake_x: t.fake_x,
        fake_y: t.fake_y,
        g_adv,
        f_adv,
        cycle,
        identity,
        total,
        grad_norm,
    };
    (g, f, phase)
}

/// Update one discriminator on a real batch and a detached fake batch.
///
/// Returns the updated discriminator and its loss.
pub fn discriminator_phase<B, OD>(
    d: Discriminator<B>,
    optim: &mut OD,
    real: Tensor<B, 4>,
    fake: Tensor<B, 4>,
    lr: f64,
    max_grad_norm: f64,
) -> (Discriminator<B>, f64)
where
    B: AutodiffBackend,
    OD: Optimizer<Discriminator<B>, B>,
{
    let loss = discriminator_loss(d.forward(real), d.forward(fake.detach()));
    let value = tensor_to_f64(loss.clone());

    let mut grads = GradientsParams::from_grads(loss.backward(), &d);
    clip_global_norm(&mut [(&d, &mut grads)], max_grad_norm);

    (optim.step(lr, d, grads), value)
}

/// Run both phases on one batch and return the updated quartet together
/// with the seven `train/*` losses.
pub fn train_step<B, OG, OD>(
    models: ModelQuartet<B>,
    optims: &mut OptimizerQuartet<OG, OD>,
    x: Tensor<B, 4>,
    y: Tensor<B, 4>,
    weights: &LossWeights,
    lrs: &LearningRates,
    max_grad_norm: f64,
) -> (ModelQuartet<B>, MetricsRecord)
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B>,
    OD: Optimizer<Discriminator<B>, B>,
{
    let ModelQuartet { g, f, dx, dy } = models;

    let (g, f, gen) = generator_phase(
        g,
        f,
        &dx,
        &dy,
        &mut optims.g,
        &mut optims.f,
        x.clone(),
        y.clone(),
        weights,
        lrs.g,
        lrs.f,
        max_grad_norm,
    );

    let (dx, loss_dx) =
        discriminator_phase(dx, &mut optims.dx, x, gen.fake_x, lrs.dx, max_grad_norm);
    let (dy, loss_dy) =
        discriminator_phase(dy, &mut optims.dy, y, gen.fake_y, lrs.dy, max_grad_norm);

    tracing::trace!(gen_grad_norm = gen.grad_norm, loss_dx, loss_dy, "Train step");

    let record = LossValues {
        loss_dx,
        loss_dy,
        f_adv: gen.f_adv,
        g_adv: gen.g_adv,
        cycle: gen.cycle,
        identity: gen.identity,
        gen_total: gen.total,
    }
    .to_record(Split::Train);

    (ModelQuartet { g, f, dx, dy }, record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::AutodiffModule;
    use burn::tensor::Distribution;

    use crate::model::{CycleGanConfig, DiscriminatorConfig, GeneratorConfig};
    use crate::training::metrics::LOSS_KEYS;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_models(device: &<TestBackend as Backend>::Device) -> ModelQuartet<TestBackend> {
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
            .init(device)
    }

    fn batch(
        device: &<TestBackend as Backend>::Device,
    ) -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 4>) {
        let x = Tensor::random([2, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), device);
        let y = Tensor::random([2, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), device);
        (x, y)
    }

    fn lrs() -> LearningRates {
        LearningRates {
            g: 2e-4,
            f: 2e-4,
            dx: 1e-4,
            dy: 1e-4,
        }
    }

    /// Flattened output of a module on a fixed input, used as a fingerprint
    /// of its parameters.
    fn gen_fingerprint(g: &Generator<TestBackend>, input: &Tensor<TestBackend, 4>) -> Vec<f32> {
        g.valid().forward(input.clone().inner()).into_data().to_vec().unwrap()
    }

    fn disc_fingerprint(
        d: &Discriminator<TestBackend>,
        input: &Tensor<TestBackend, 4>,
    ) -> Vec<f32> {
        d.valid().forward(input.clone().inner()).into_data().to_vec().unwrap()
    }

    fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(p, q)| (p - q).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_train_step_updates_all_four_networks() {
        let device = Default::default();
        let models = tiny_models(&device);
        let mut optims = OptimizerConfig::new().init::<TestBackend>();
        let (x, y) = batch(&device);
        let input = Tensor::random([1, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), &device);

        let before = (
            gen_fingerprint(&models.g, &input),
            gen_fingerprint(&models.f, &input),
            disc_fingerprint(&models.dx, &input),
            disc_fingerprint(&models.dy, &input),
        );

        let weights = LossWeights::new();
        let (models, _) = train_step(models, &mut optims, x, y, &weights, &lrs(), 1.0);

        assert!(max_abs_diff(&before.0, &gen_fingerprint(&models.g, &input)) > 0.0, "G frozen");
        assert!(max_abs_diff(&before.1, &gen_fingerprint(&models.f, &input)) > 0.0, "F frozen");
        assert!(max_abs_diff(&before.2, &disc_fingerprint(&models.dx, &input)) > 0.0, "DX frozen");
        assert!(max_abs_diff(&before.3, &disc_fingerprint(&models.dy, &input)) > 0.0, "DY frozen");
    }

    #[test]
    fn test_train_step_reports_seven_finite_losses() {
        let device = Default::default();
        let mut models = tiny_models(&device);
        let mut optims = OptimizerConfig::new().init::<TestBackend>();
        let weights = LossWeights::new();

        for _ in 0..3 {
            let (x, y) = batch(&device);
            let (updated, record) = train_step(models, &mut optims, x, y, &weights, &lrs(), 1.0);
            models = updated;
            assert_eq!(record.len(), 7);
            for key in LOSS_KEYS {
                let v = record.get(Split::Train, key).unwrap();
                assert!(v.is_finite(), "{key} = {v}");
            }
            record.ensure_finite().unwrap();
        }
    }

    #[test]
    fn test_generator_loss_uses_pre_step_discriminators() {
        let device = Default::default();
        let models = tiny_models(&device);
        let snapshot = models.clone();
        let mut optims = OptimizerConfig::new().init::<TestBackend>();
        let (x, y) = batch(&device);
        let weights = LossWeights::new();

        let (_, record) =
            train_step(models, &mut optims, x.clone(), y.clone(), &weights, &lrs(), 1.0);

        let t = translate(&snapshot.g, &snapshot.f, x.clone(), y.clone());
        let expected = generator_losses(
            &snapshot.g,
            &snapshot.f,
            &snapshot.dx,
            &snapshot.dy,
            x,
            y,
            &t,
            &weights,
        );
        let expected = tensor_to_f64(expected.total);
        let reported = record.get(Split::Train, "loss_gen_total").unwrap();
        assert!(
            (expected - reported).abs() < 1e-5 * expected.abs().max(1.0),
            "expected {expected}, reported {reported}"
        );
    }

    #[test]
    fn test_discriminator_phase_leaves_generators_untouched() {
        let device = Default::default();
        let models = tiny_models(&device);
        let mut optims = OptimizerConfig::new().init::<TestBackend>();
        let (x, y) = batch(&device);
        let input = Tensor::random([1, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), &device);

        let ModelQuartet { g, f, dx, dy } = models;
        let fake_x = f.forward(y);
        let fake_y = g.forward(x.clone());
        let g_before = gen_fingerprint(&g, &input);
        let f_before = gen_fingerprint(&f, &input);

        let _ = discriminator_phase(dx, &mut optims.dx, x.clone(), fake_x, 1e-4, 1.0);
        let _ = discriminator_phase(dy, &mut optims.dy, x, fake_y, 1e-4, 1.0);

        assert_eq!(g_before, gen_fingerprint(&g, &input));
        assert_eq!(f_before, gen_fingerprint(&f, &input));
    }

    #[test]
    fn test_detached_fake_produces_no_generator_gradients() {
        let device = Default::default();
        let models = tiny_models(&device);
        let (x, _) = batch(&device);

        let fake_y = models.g.forward(x.clone());
        let loss = discriminator_loss(models.dy.forward(x), models.dy.forward(fake_y.detach()));
        let mut grads = loss.backward();

        let g_grads = GradientsParams::from_module(&mut grads, &models.g);
        assert!(g_grads.is_empty(), "generator received discriminator gradients");
        let d_grads = GradientsParams::from_module(&mut grads, &models.dy);
        assert!(!d_grads.is_empty());
    }
}
