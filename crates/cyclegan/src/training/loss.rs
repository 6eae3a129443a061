//! Adversarial, cycle-consistency and identity losses.
//!
//! All functions are generic over `B: Backend`, side-effect free, and return
//! scalar tensors of shape `(1,)`. Adversarial terms use least-squares
//! (MSE) targets; cycle and identity terms use mean absolute error.

use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::*;

use crate::model::{Discriminator, Generator};

/// Scalar weights of the three generator objectives, fixed for a run.
#[derive(Config, Debug, Copy)]
pub struct LossWeights {
    #[config(default = 2.0)]
    pub adversarial: f64,
    #[config(default = 4.0)]
    pub cycle: f64,
    #[config(default = 0.5)]
    pub identity: f64,
}

/// Mean squared error between two tensors.
pub fn mse<B: Backend, const D: usize>(pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    MseLoss::new().forward(pred, target, Reduction::Mean)
}

/// Mean absolute error between two tensors.
pub fn l1<B: Backend, const D: usize>(pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    (pred - target).abs().mean()
}

/// Least-squares "fool the discriminator" loss: push `logits` toward 1.
pub fn adversarial_loss<B: Backend>(logits: Tensor<B, 4>) -> Tensor<B, 1> {
    let target = logits.ones_like();
    mse(logits, target)
}

/// Discriminator realism loss: real toward 1, fake toward 0, averaged.
///
/// The 0.5 factor keeps the discriminator's effective loss magnitude at the
/// scale of a single term.
pub fn discriminator_loss<B: Backend>(
    real_logits: Tensor<B, 4>,
    fake_logits: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let ones = real_logits.ones_like();
    let zeros = fake_logits.zeros_like();
    (mse(real_logits, ones) + mse(fake_logits, zeros)).mul_scalar(0.5)
}

/// Cycle term: `|F(G(x)) - x| + |G(F(y)) - y|`.
pub fn cycle_loss<B: Backend>(
    rec_x: Tensor<B, 4>,
    x: Tensor<B, 4>,
    rec_y: Tensor<B, 4>,
    y: Tensor<B, 4>,
) -> Tensor<B, 1> {
    l1(rec_x, x) + l1(rec_y, y)
}

/// Identity term: `|G(y) - y| + |F(x) - x|` (each generator fed its output domain).
pub fn identity_loss<B: Backend>(
    g_of_y: Tensor<B, 4>,
    y: Tensor<B, 4>,
    f_of_x: Tensor<B, 4>,
    x: Tensor<B, 4>,
) -> Tensor<B, 1> {
    l1(g_of_y, y) + l1(f_of_x, x)
}

/// Synthesised images and reconstructions for one batch.
#[derive(Debug, Clone)]
pub struct Translations<B: Backend> {
    /// `F(y)`: old → young.
    pub fake_x: Tensor<B, 4>,
    /// `G(x)`: young → old.
    pub fake_y: Tensor<B, 4>,
    /// `F(G(x))`.
    pub rec_x: Tensor<B, 4>,
    /// `G(F(y))`.
    pub rec_y: Tensor<B, 4>,
}

/// Forward both generators and both round trips.
pub fn translate<B: Backend>(
    g: &Generator<B>,
    f: &Generator<B>,
    x: Tensor<B, 4>,
    y: Tensor<B, 4>,
) -> Translations<B> {
    let fake_x = f.forward(y);
    let fake_y = g.forward(x);
    let rec_x = f.forward(fake_y.clone());
    let rec_y = g.forward(fake_x.clone());
    Translations {
        fake_x,
        fake_y,
        rec_x,
        rec_y,
    }
}

/// Weighted generator loss terms. Each term already includes its weight.
#[derive(Debug, Clone)]
pub struct GeneratorLosses<B: Backend> {
    /// Adversarial term for G (judged by DY).
    pub g_adv: Tensor<B, 1>,
    /// Adversarial term for F (judged by DX).
    pub f_adv: Tensor<B, 1>,
    pub cycle: Tensor<B, 1>,
    pub identity: Tensor<B, 1>,
    pub total: Tensor<B, 1>,
}

/// Compute the weighted generator objective from the current discriminators.
#[allow(clippy::too_many_arguments)]
pub fn generator_losses<B: Backend>(
    g: &Generator<B>,
    f: &Generator<B>,
    dx: &Discriminator<B>,
    dy: &Discriminator<B>,
    x: Tensor<B, 4>,
    y: Tensor<B, 4>,
    t: &Translations<B>,
    weights: &LossWeights,
) -> GeneratorLosses<B> {
    let f_adv = adversarial_loss(dx.forward(t.fake_x.clone())).mul_scalar(weights.adversarial);
    let g_adv = adversarial_loss(dy.forward(t.fake_y.clone())).mul_scalar(weights.adversarial);

    let cycle = cycle_loss(t.rec_x.clone(), x.clone(), t.rec_y.clone(), y.clone())
        .mul_scalar(weights.cycle);

    let identity = identity_loss(g.forward(y.clone()), y, f.forward(x.clone()), x)
        .mul_scalar(weights.identity);

    let total = g_adv.clone() + f_adv.clone() + cycle.clone() + identity.clone();
    GeneratorLosses {
        g_adv,
        f_adv,
        cycle,
        identity,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn constant(value: f32, shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::full(shape, value, &Default::default())
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar().elem()
    }

    #[test]
    fn test_adversarial_loss_targets_ones() {
        assert!(scalar(adversarial_loss(constant(1.0, [2, 1, 2, 2]))).abs() < 1e-7);
        // (0 - 1)^2 = 1
        assert!((scalar(adversarial_loss(constant(0.0, [2, 1, 2, 2]))) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_discriminator_loss_halves_sum() {
        // real at 0 -> (0-1)^2 = 1; fake at 1 -> (1-0)^2 = 1; 0.5 * (1 + 1) = 1
        let loss = discriminator_loss(constant(0.0, [1, 1, 2, 2]), constant(1.0, [1, 1, 2, 2]));
        assert!((scalar(loss) - 1.0).abs() < 1e-6);

        // perfect discriminator -> 0
        let loss = discriminator_loss(constant(1.0, [1, 1, 2, 2]), constant(0.0, [1, 1, 2, 2]));
        assert!(scalar(loss).abs() < 1e-7);

        // real at 0.5, fake at 0.5 -> 0.5 * (0.25 + 0.25) = 0.25
        let loss = discriminator_loss(constant(0.5, [1, 1, 2, 2]), constant(0.5, [1, 1, 2, 2]));
        assert!((scalar(loss) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_cycle_loss_sums_both_directions() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.0f32, 1.0, 2.0, 3.0], [1, 1, 2, 2]),
            &device,
        );
        let rec_x = x.clone().add_scalar(0.5); // mean |diff| = 0.5
        let y = constant(0.0, [1, 1, 2, 2]);
        let rec_y = constant(-0.25, [1, 1, 2, 2]); // mean |diff| = 0.25
        let loss = cycle_loss(rec_x, x, rec_y, y);
        assert!((scalar(loss) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_identity_loss_zero_for_unchanged_inputs() {
        let x = constant(0.3, [1, 3, 2, 2]);
        let y = constant(-0.7, [1, 3, 2, 2]);
        let loss = identity_loss(y.clone(), y, x.clone(), x);
        assert!(scalar(loss).abs() < 1e-7);
    }

    #[test]
    fn test_l1_and_mse() {
        let a = constant(1.0, [1, 1, 1, 2]);
        let b = constant(-1.0, [1, 1, 1, 2]);
        assert!((scalar(l1(a.clone(), b.clone())) - 2.0).abs() < 1e-6);
        assert!((scalar(mse(a, b)) - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_generator_losses_apply_weights() {
        use crate::model::{CycleGanConfig, DiscriminatorConfig, GeneratorConfig};

        let device = Default::default();
        let models = CycleGanConfig::new()
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
            .init::<TestBackend>(&device);
        let x = constant(0.2, [1, 3, 8, 8]);
        let y = constant(-0.4, [1, 3, 8, 8]);

        let t = translate(&models.g, &models.f, x.clone(), y.clone());
        let unit = LossWeights::new()
            .with_adversarial(1.0)
            .with_cycle(1.0)
            .with_identity(1.0);
        let doubled = LossWeights::new()
            .with_adversarial(2.0)
            .with_cycle(2.0)
            .with_identity(2.0);

        let a = generator_losses(
            &models.g,
            &models.f,
            &models.dx,
            &models.dy,
            x.clone(),
            y.clone(),
            &t,
            &unit,
        );
        let b = generator_losses(
            &models.g,
            &models.f,
            &models.dx,
            &models.dy,
            x,
            y,
            &t,
            &doubled,
        );

        let total_a = scalar(a.total.clone());
        let sum_a = scalar(a.g_adv) + scalar(a.f_adv) + scalar(a.cycle) + scalar(a.identity);
        assert!((total_a - sum_a).abs() < 1e-5, "total must be the sum of terms");
        assert!((scalar(b.total) - 2.0 * total_a).abs() < 1e-4);
    }
}
