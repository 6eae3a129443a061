//! Batch loaders over unpaired splits.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::reader::UnpairedSplit;
use crate::transform::ImageTransform;
use crate::types::{DataError, ImageBatch};

/// Source of unpaired batches for one split.
///
/// A pass is started with [`BatchLoader::begin_pass`], then batches
/// `0..num_batches()` are requested in order.
pub trait BatchLoader {
    /// Number of batches in one pass.
    fn num_batches(&self) -> usize;

    /// Prepare a new pass (reshuffle, if the loader shuffles).
    fn begin_pass(&mut self, _rng: &mut StdRng) {}

    /// Load batch `index` of the current pass.
    fn load_batch(&self, index: usize, rng: &mut StdRng) -> Result<ImageBatch, DataError>;
}

/// Disk-backed loader decoding JPGs on a rayon pool.
pub struct UnpairedLoader {
    split: UnpairedSplit,
    transform: ImageTransform,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    order: Vec<usize>,
    pool: rayon::ThreadPool,
}

impl UnpairedLoader {
    /// Loader for the training split: shuffled every pass, last partial batch dropped.
    pub fn train(
        split: UnpairedSplit,
        image_size: u32,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self, DataError> {
        Self::new(split, ImageTransform::train(image_size), batch_size, true, true, num_workers)
    }

    /// Loader for validation/test: fixed order, last partial batch kept.
    pub fn eval(
        split: UnpairedSplit,
        image_size: u32,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self, DataError> {
        Self::new(split, ImageTransform::eval(image_size), batch_size, false, false, num_workers)
    }

    pub fn new(
        split: UnpairedSplit,
        transform: ImageTransform,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        num_workers: usize,
    ) -> Result<Self, DataError> {
        if batch_size == 0 {
            return Err(DataError::Shape("batch_size must be > 0".to_string()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .build()
            .map_err(|e| DataError::Io(std::io::Error::other(e)))?;
        let order = (0..split.len()).collect();
        Ok(Self {
            split,
            transform,
            batch_size,
            shuffle,
            drop_last,
            order,
            pool,
        })
    }

    /// Number of unpaired items in the split.
    pub fn num_items(&self) -> usize {
        self.split.len()
    }
}

impl BatchLoader for UnpairedLoader {
    fn num_batches(&self) -> usize {
        batch_count(self.split.len(), self.batch_size, self.drop_last)
    }

    fn begin_pass(&mut self, rng: &mut StdRng) {
        self.order = (0..self.split.len()).collect();
        if self.shuffle {
            self.order.shuffle(rng);
        }
    }

    fn load_batch(&self, index: usize, rng: &mut StdRng) -> Result<ImageBatch, DataError> {
        let len = self.num_batches();
        if index >= len {
            return Err(DataError::OutOfRange { index, len });
        }
        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.order.len());
        let items = &self.order[start..end];

        // One seed per item keeps augmentation reproducible regardless of
        // which worker decodes it.
        let seeds: Vec<u64> = items.iter().map(|_| rng.gen()).collect();
        let transform = self.transform;
        let split = &self.split;

        let decoded: Vec<(Vec<f32>, Vec<f32>)> = self.pool.install(|| {
            items
                .par_iter()
                .zip(seeds.par_iter())
                .map(|(&item, &seed)| {
                    let mut item_rng = StdRng::seed_from_u64(seed);
                    let (young, old) = split
                        .item(item)
                        .ok_or(DataError::OutOfRange { index: item, len: split.len() })?;
                    let x = transform.load(&young.path, &mut item_rng)?;
                    let y = transform.load(&old.path, &mut item_rng)?;
                    Ok((x, y))
                })
                .collect::<Result<Vec<_>, DataError>>()
        })?;

        let per_image = transform.image_len();
        let mut x = Vec::with_capacity(decoded.len() * per_image);
        let mut y = Vec::with_capacity(decoded.len() * per_image);
        for (xi, yi) in decoded {
            x.extend(xi);
            y.extend(yi);
        }
        let side = transform.image_size as usize;
        ImageBatch::new(x, y, items.len(), 3, side, side)
    }
}

/// In-memory loader over pre-transformed images.
///
/// Used for synthetic data and tests; no shuffling or augmentation.
#[derive(Debug, Clone)]
pub struct InMemoryLoader {
    batches: Vec<ImageBatch>,
}

impl InMemoryLoader {
    pub fn new(batches: Vec<ImageBatch>) -> Self {
        Self { batches }
    }

    /// Group per-image buffers into unpaired batches of `batch_size`.
    ///
    /// Sides of unequal length are paired with wraparound, as on disk.
    pub fn from_images(
        young: &[Vec<f32>],
        old: &[Vec<f32>],
        shape: [usize; 3],
        batch_size: usize,
    ) -> Result<Self, DataError> {
        if young.is_empty() || old.is_empty() {
            return Err(DataError::EmptyDomain {
                young: young.len(),
                old: old.len(),
            });
        }
        if batch_size == 0 {
            return Err(DataError::Shape("batch_size must be > 0".to_string()));
        }
        let [c, h, w] = shape;
        let n = young.len().max(old.len());
        let mut batches = Vec::new();
        let mut start = 0;
        while start < n {
            let end = (start + batch_size).min(n);
            let mut x = Vec::new();
            let mut y = Vec::new();
            for i in start..end {
                x.extend_from_slice(&young[i % young.len()]);
                y.extend_from_slice(&old[i % old.len()]);
            }
            batches.push(ImageBatch::new(x, y, end - start, c, h, w)?);
            start = end;
        }
        Ok(Self { batches })
    }
}

impl BatchLoader for InMemoryLoader {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn load_batch(&self, index: usize, _rng: &mut StdRng) -> Result<ImageBatch, DataError> {
        self.batches
            .get(index)
            .cloned()
            .ok_or(DataError::OutOfRange {
                index,
                len: self.batches.len(),
            })
    }
}

fn batch_count(items: usize, batch_size: usize, drop_last: bool) -> usize {
    if drop_last {
        items / batch_size
    } else {
        items.div_ceil(batch_size)
    }
}
