//! Global-norm gradient clipping across one or more modules.
//!
//! burn's optimizer-level clipping works per parameter; G and F must be
//! clipped as a single group, so the total norm is computed here by visiting
//! every float parameter and looking its gradient up in `GradientsParams`.

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

/// Added to the total norm before dividing, as in clip-by-total-norm.
const NORM_EPS: f64 = 1e-6;

struct SquaredNorm<'a> {
    grads: &'a GradientsParams,
    sum: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            let sq: f64 = (grad.clone() * grad).sum().into_scalar().elem();
            self.sum += sq;
        }
    }
}

struct ScaleGrads<'a> {
    grads: &'a mut GradientsParams,
    scale: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleGrads<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads
                .register::<B::InnerBackend, D>(id, grad.mul_scalar(self.scale));
        }
    }
}

/// L2 norm of all gradients of `module` found in `grads`.
pub fn grad_norm<B, M>(module: &M, grads: &GradientsParams) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = SquaredNorm { grads, sum: 0.0 };
    module.visit(&mut visitor);
    visitor.sum.sqrt()
}

/// Clip the gradients of every `(module, grads)` pair as one group so that
/// their combined L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_global_norm<B, M>(groups: &mut [(&M, &mut GradientsParams)], max_norm: f64) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let total = groups
        .iter()
        .map(|(module, grads)| {
            let mut visitor = SquaredNorm {
                grads: &**grads,
                sum: 0.0,
            };
            module.visit(&mut visitor);
            visitor.sum
        })
        .sum::<f64>()
        .sqrt();

    let scale = max_norm / (total + NORM_EPS);
    if scale < 1.0 {
        for (module, grads) in groups.iter_mut() {
            let mut visitor = ScaleGrads {
                grads: &mut **grads,
                scale,
            };
            module.visit(&mut visitor);
        }
        tracing::trace!(total, scale, "Clipped gradients");
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    use crate::model::{Discriminator, DiscriminatorConfig};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn disc(device: &<TestBackend as Backend>::Device) -> Discriminator<TestBackend> {
        DiscriminatorConfig::new()
            .with_base_filters(2)
            .with_n_downsample(2)
            .init(device)
    }

    fn grads_for(
        model: &Discriminator<TestBackend>,
        input: Tensor<TestBackend, 4>,
        scale: f32,
    ) -> GradientsParams {
        let loss = model.forward(input).sum().mul_scalar(scale);
        GradientsParams::from_grads(loss.backward(), model)
    }

    #[test]
    fn test_large_gradients_clipped_to_max_norm() {
        let device = Default::default();
        let model = disc(&device);
        let input = Tensor::<TestBackend, 4>::random(
            [2, 3, 8, 8],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let mut grads = grads_for(&model, input, 1e4);
        let before = grad_norm(&model, &grads);
        assert!(before > 1.0, "test needs a large gradient, got {before}");

        let reported = clip_global_norm(&mut [(&model, &mut grads)], 1.0);
        assert!((reported - before).abs() / before < 1e-6);

        let after = grad_norm(&model, &grads);
        assert!(after <= 1.0 + 1e-4, "norm after clipping: {after}");
        assert!(after > 0.99, "clipping must rescale, not zero: {after}");
    }

    #[test]
    fn test_small_gradients_untouched() {
        let device = Default::default();
        let model = disc(&device);
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);
        let mut grads = grads_for(&model, input, 1e-6);
        let before = grad_norm(&model, &grads);
        assert!(before < 1.0);

        clip_global_norm(&mut [(&model, &mut grads)], 1.0);
        let after = grad_norm(&model, &grads);
        assert!((after - before).abs() < 1e-12);
    }

    #[test]
    fn test_group_norm_is_joint() {
        let device = Default::default();
        let a = disc(&device);
        let b = disc(&device);
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);
        let mut ga = grads_for(&a, input.clone(), 1e3);
        let mut gb = grads_for(&b, input, 1e3);

        let na = grad_norm(&a, &ga);
        let nb = grad_norm(&b, &gb);
        let total = clip_global_norm(&mut [(&a, &mut ga), (&b, &mut gb)], 1.0);
        assert!((total - (na * na + nb * nb).sqrt()).abs() / total < 1e-6);

        let na_after = grad_norm(&a, &ga);
        let nb_after = grad_norm(&b, &gb);
        let joint = (na_after * na_after + nb_after * nb_after).sqrt();
        assert!(joint <= 1.0 + 1e-4, "joint norm after clipping: {joint}");
        // Relative proportions survive a shared scale.
        assert!((na_after / nb_after - na / nb).abs() < 1e-3 * (na / nb).max(1.0));
    }
}
