//! Fréchet distance between real and generated feature distributions.
//!
//! The accumulator keeps running sums of features and feature outer products
//! for both streams in f64, so memory stays `O(d^2)` regardless of how many
//! images are seen. Usage per evaluation pass: `reset`, any number of
//! `update` calls, then exactly one `compute`.

use burn::prelude::*;
use burn::tensor::module::adaptive_avg_pool2d;
use nalgebra::{DMatrix, DVector, SymmetricEigen};

/// Errors from [`FidAccumulator`].
#[derive(Debug, thiserror::Error)]
pub enum FidError {
    #[error("FID already computed for this pass; call reset() first")]
    Finalized,

    #[error("FID needs at least 2 samples per stream (real: {real}, generated: {generated})")]
    TooFewSamples { real: usize, generated: usize },

    #[error("Feature dimension mismatch: expected {expected}, got {got}")]
    DimMismatch { expected: usize, got: usize },

    #[error("{len} values do not split into rows of width {dim}")]
    RaggedRows { dim: usize, len: usize },

    #[error("Failed to read features: {0}")]
    Readback(String),
}

/// Maps images in `[0, 1]` of shape `[N, C, H, W]` to features `[N, D]`.
pub trait FeatureExtractor<B: Backend> {
    /// Feature width `D`.
    fn dim(&self) -> usize;

    fn extract(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Adaptive average pooling to a `grid x grid` map per channel, flattened.
#[derive(Debug, Clone, Copy)]
pub struct PooledFeatures {
    pub channels: usize,
    pub grid: usize,
}

impl PooledFeatures {
    pub fn new(channels: usize, grid: usize) -> Self {
        Self { channels, grid }
    }

    fn width(&self) -> usize {
        self.channels * self.grid * self.grid
    }
}

impl Default for PooledFeatures {
    fn default() -> Self {
        Self::new(3, 4)
    }
}

impl<B: Backend> FeatureExtractor<B> for PooledFeatures {
    fn dim(&self) -> usize {
        self.width()
    }

    fn extract(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [n, ..] = images.dims();
        adaptive_avg_pool2d(images, [self.grid, self.grid]).reshape([n, self.width()])
    }
}

/// Which distribution a batch of features belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Real,
    Generated,
}

#[derive(Debug, Clone)]
struct Moments {
    sum: DVector<f64>,
    outer: DMatrix<f64>,
    count: usize,
}

impl Moments {
    fn new(dim: usize) -> Self {
        Self {
            sum: DVector::zeros(dim),
            outer: DMatrix::zeros(dim, dim),
            count: 0,
        }
    }

    fn add(&mut self, row: &[f64]) {
        let v = DVector::from_column_slice(row);
        self.outer += &v * v.transpose();
        self.sum += v;
        self.count += 1;
    }

    /// Mean and unbiased covariance.
    fn finish(&self) -> (DVector<f64>, DMatrix<f64>) {
        let n = self.count as f64;
        let mean = &self.sum / n;
        let cov = (&self.outer - (&mean * mean.transpose()) * n) / (n - 1.0);
        (mean, cov)
    }
}

/// Running FID statistic over one evaluation pass.
#[derive(Debug, Clone)]
pub struct FidAccumulator {
    dim: usize,
    real: Moments,
    generated: Moments,
    finalized: bool,
}

impl FidAccumulator {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            real: Moments::new(dim),
            generated: Moments::new(dim),
            finalized: false,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Samples seen so far as `(real, generated)`.
    pub fn counts(&self) -> (usize, usize) {
        (self.real.count, self.generated.count)
    }

    /// Clear both streams and allow updates again.
    pub fn reset(&mut self) {
        self.real = Moments::new(self.dim);
        self.generated = Moments::new(self.dim);
        self.finalized = false;
    }

    /// Add rows of features to one stream.
    pub fn update_rows(&mut self, rows: &[f64], stream: Stream) -> Result<(), FidError> {
        if self.finalized {
            return Err(FidError::Finalized);
        }
        if rows.len() % self.dim != 0 {
            return Err(FidError::RaggedRows {
                dim: self.dim,
                len: rows.len(),
            });
        }
        let target = match stream {
            Stream::Real => &mut self.real,
            Stream::Generated => &mut self.generated,
        };
        for row in rows.chunks_exact(self.dim) {
            target.add(row);
        }
        Ok(())
    }

    /// Add a `[N, D]` feature tensor to one stream.
    pub fn update<B: Backend>(
        &mut self,
        features: Tensor<B, 2>,
        stream: Stream,
    ) -> Result<(), FidError> {
        let [_, d] = features.dims();
        if d != self.dim {
            return Err(FidError::DimMismatch {
                expected: self.dim,
                got: d,
            });
        }
        let rows: Vec<f64> = features
            .into_data()
            .convert::<f64>()
            .to_vec()
            .map_err(|e| FidError::Readback(format!("{e:?}")))?;
        self.update_rows(&rows, stream)
    }

    /// Extract features from images in `[0, 1]` and add them to one stream.
    pub fn update_images<B: Backend, E: FeatureExtractor<B>>(
        &mut self,
        extractor: &E,
        images: Tensor<B, 4>,
        stream: Stream,
    ) -> Result<(), FidError> {
        self.update(extractor.extract(images), stream)
    }

    /// Finalise the statistic. The accumulator must be reset before reuse.
    pub fn compute(&mut self) -> Result<f64, FidError> {
        if self.finalized {
            return Err(FidError::Finalized);
        }
        if self.real.count < 2 || self.generated.count < 2 {
            return Err(FidError::TooFewSamples {
                real: self.real.count,
                generated: self.generated.count,
            });
        }
        self.finalized = true;

        let (mu_r, cov_r) = self.real.finish();
        let (mu_g, cov_g) = self.generated.finish();

        let diff = &mu_r - &mu_g;
        let sqrt_r = sqrtm_psd(&cov_r);
        let inner = &sqrt_r * &cov_g * &sqrt_r;
        let covmean_trace = sqrtm_psd(&inner).trace();

        let fid = diff.dot(&diff) + cov_r.trace() + cov_g.trace() - 2.0 * covmean_trace;
        Ok(fid.max(0.0))
    }
}

/// Principal square root of a symmetric positive semi-definite matrix.
/// Negative eigenvalues from round-off are clamped to zero.
fn sqrtm_psd(m: &DMatrix<f64>) -> DMatrix<f64> {
    let sym = (m + m.transpose()) * 0.5;
    let eig = SymmetricEigen::new(sym);
    let roots = eig.eigenvalues.map(|v| v.max(0.0).sqrt());
    &eig.eigenvectors * DMatrix::from_diagonal(&roots) * eig.eigenvectors.transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn samples(shift: f64) -> Vec<f64> {
        // Four 3-d points with non-degenerate spread.
        let base = [
            [0.0, 1.0, 0.5],
            [1.0, 0.0, 0.2],
            [0.5, 0.5, 1.0],
            [0.2, 0.8, 0.0],
        ];
        base.iter().flat_map(|r| r.iter().map(move |v| v + shift)).collect()
    }

    #[test]
    fn test_identical_distributions_score_zero() {
        let mut fid = FidAccumulator::new(3);
        fid.update_rows(&samples(0.0), Stream::Real).unwrap();
        fid.update_rows(&samples(0.0), Stream::Generated).unwrap();
        let score = fid.compute().unwrap();
        assert!(score.abs() < 1e-6, "got {score}");
    }

    #[test]
    fn test_shifted_mean_scores_squared_distance() {
        let mut fid = FidAccumulator::new(3);
        fid.update_rows(&samples(0.0), Stream::Real).unwrap();
        fid.update_rows(&samples(2.0), Stream::Generated).unwrap();
        let score = fid.compute().unwrap();
        // Same covariance, mean shifted by 2 in each of 3 dims: 3 * 4 = 12.
        assert!((score - 12.0).abs() < 1e-6, "got {score}");
    }

    #[test]
    fn test_compute_consumes_accumulator() {
        let mut fid = FidAccumulator::new(3);
        fid.update_rows(&samples(0.0), Stream::Real).unwrap();
        fid.update_rows(&samples(1.0), Stream::Generated).unwrap();
        let first = fid.compute().unwrap();

        assert!(matches!(fid.compute(), Err(FidError::Finalized)));
        assert!(matches!(
            fid.update_rows(&samples(0.0), Stream::Real),
            Err(FidError::Finalized)
        ));

        fid.reset();
        assert_eq!(fid.counts(), (0, 0));
        fid.update_rows(&samples(0.0), Stream::Real).unwrap();
        fid.update_rows(&samples(1.0), Stream::Generated).unwrap();
        let second = fid.compute().unwrap();
        assert!((first - second).abs() < 1e-9, "reset must clear previous pass");
    }

    #[test]
    fn test_too_few_samples() {
        let mut fid = FidAccumulator::new(3);
        fid.update_rows(&[0.0, 0.0, 0.0], Stream::Real).unwrap();
        fid.update_rows(&samples(0.0), Stream::Generated).unwrap();
        assert!(matches!(
            fid.compute(),
            Err(FidError::TooFewSamples { real: 1, generated: 4 })
        ));
    }

    #[test]
    fn test_dim_mismatch() {
        let device = Default::default();
        let mut fid = FidAccumulator::new(3);
        let feats = Tensor::<TestBackend, 2>::zeros([2, 4], &device);
        assert!(matches!(
            fid.update(feats, Stream::Real),
            Err(FidError::DimMismatch { expected: 3, got: 4 })
        ));
    }

    #[test]
    fn test_pooled_features_shape_and_values() {
        let device = Default::default();
        let extractor = PooledFeatures::new(3, 2);
        let data: Vec<f32> = (0..2 * 3 * 4 * 4).map(|i| (i % 7) as f32 / 7.0).collect();
        let images =
            Tensor::<TestBackend, 4>::from_data(TensorData::new(data, [2, 3, 4, 4]), &device);
        let feats = FeatureExtractor::<TestBackend>::extract(&extractor, images);
        assert_eq!(feats.dims(), [2, 12]);
        assert_eq!(FeatureExtractor::<TestBackend>::dim(&extractor), 12);

        let ones = Tensor::<TestBackend, 4>::ones([1, 3, 4, 4], &device);
        let pooled: Vec<f32> = extractor.extract(ones).into_data().to_vec().unwrap();
        assert!(pooled.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }
}
