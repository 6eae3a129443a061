//! Execution context: device placement for models, optimizers and batches.
//!
//! Models and optimizers are handed over by value and come back wrapped in
//! [`Prepared`]. Only the returned values are used afterwards; the schedule
//! constructor takes a `&Prepared<OptimizerQuartet<..>>` so schedules cannot
//! be built before the optimizers have been prepared.

use std::ops::{Deref, DerefMut};

use burn::prelude::*;
use faces::ImageBatch;

use crate::model::bridge::batch_to_tensors;
use crate::model::ModelQuartet;
use crate::training::step::OptimizerQuartet;

/// A value that has been placed under an [`ExecutionContext`].
#[derive(Debug)]
pub struct Prepared<T>(T);

impl<T> Prepared<T> {
    /// Replace the wrapped value with the result of `f`, staying prepared.
    pub fn map(self, f: impl FnOnce(T) -> T) -> Self {
        Prepared(f(self.0))
    }

    /// Give up the context; used when the value leaves the training loop.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Prepared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Prepared<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// Single-device, full-precision execution substrate.
#[derive(Debug, Clone)]
pub struct ExecutionContext<B: Backend> {
    device: B::Device,
}

impl<B: Backend> ExecutionContext<B> {
    pub fn new(device: B::Device) -> Self {
        tracing::info!(device = ?device, "Execution context");
        Self { device }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Move the quartet onto this context's device.
    pub fn prepare_models(&self, models: ModelQuartet<B>) -> Prepared<ModelQuartet<B>> {
        Prepared(models.to_device(&self.device))
    }

    /// Take ownership of the optimizers. Their state is created lazily on
    /// the device of the gradients they receive.
    pub fn prepare_optimizers<OG, OD>(
        &self,
        optimizers: OptimizerQuartet<OG, OD>,
    ) -> Prepared<OptimizerQuartet<OG, OD>> {
        Prepared(optimizers)
    }

    /// Upload a loader batch as `(x, y)` tensors.
    pub fn batch(&self, batch: &ImageBatch) -> (Tensor<B, 4>, Tensor<B, 4>) {
        batch_to_tensors(batch, &self.device)
    }

    /// Wait for outstanding device work so the backend can reclaim buffers.
    pub fn release_memory(&self) {
        B::sync(&self.device);
        tracing::debug!("Released device memory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    use crate::model::{CycleGanConfig, DiscriminatorConfig, GeneratorConfig};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_prepared_map_keeps_wrapper() {
        let p = Prepared(3usize);
        let p = p.map(|v| v * 2);
        assert_eq!(*p, 6);
        assert_eq!(p.into_inner(), 6);
    }

    #[test]
    fn test_prepare_models_preserves_parameters() {
        let ctx = ExecutionContext::<TestBackend>::new(Default::default());
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
            .init::<TestBackend>(ctx.device());
        let n = models.num_params();
        let prepared = ctx.prepare_models(models);
        assert_eq!(prepared.num_params(), n);
        ctx.release_memory();
    }
}
