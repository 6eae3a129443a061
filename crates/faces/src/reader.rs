//! Dataset indexing: directory scan, age bucketing, deterministic splits.

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::types::{AgeDomain, AgeThresholds, DataError, FaceRecord, Split};

/// Location of the aligned-and-cropped images below the data directory.
pub const UTKFACE_SUBDIR: &str = "utkface_aligned_cropped/UTKFace";

/// Faces bucketed into the young and old domains, in sorted path order.
#[derive(Debug, Clone)]
pub struct FaceIndex {
    young: Vec<FaceRecord>,
    old: Vec<FaceRecord>,
}

impl FaceIndex {
    /// Scan `<data_dir>/utkface_aligned_cropped/UTKFace/*.jpg` and bucket by age.
    ///
    /// Fails fast when no images exist or either domain ends up empty.
    pub fn scan(data_dir: &Path, thresholds: &AgeThresholds) -> Result<Self, DataError> {
        let root = data_dir.join(UTKFACE_SUBDIR);
        if !root.is_dir() {
            return Err(DataError::NoImages(root));
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&root)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("jpg"))
            })
            .collect();
        if paths.is_empty() {
            return Err(DataError::NoImages(root));
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        let mut unparsed = 0usize;
        for path in &paths {
            match FaceRecord::from_path(path) {
                Some(rec) => records.push(rec),
                None => unparsed += 1,
            }
        }
        if unparsed > 0 {
            tracing::warn!(unparsed, root = %root.display(), "Skipped files without an age prefix");
        }

        let index = Self::from_records(records, thresholds)?;
        tracing::info!(
            young = index.young.len(),
            old = index.old.len(),
            root = %root.display(),
            "Indexed UTKFace"
        );
        Ok(index)
    }

    /// Bucket already-parsed records. Records outside both domains are dropped.
    pub fn from_records(
        records: Vec<FaceRecord>,
        thresholds: &AgeThresholds,
    ) -> Result<Self, DataError> {
        let mut young = Vec::new();
        let mut old = Vec::new();
        for rec in records {
            match thresholds.classify(rec.age) {
                Some(AgeDomain::Young) => young.push(rec),
                Some(AgeDomain::Old) => old.push(rec),
                None => {}
            }
        }
        if young.is_empty() || old.is_empty() {
            return Err(DataError::EmptyDomain {
                young: young.len(),
                old: old.len(),
            });
        }
        Ok(Self { young, old })
    }

    pub fn young(&self) -> &[FaceRecord] {
        &self.young
    }

    pub fn old(&self) -> &[FaceRecord] {
        &self.old
    }

    /// Select one partition of both domains.
    ///
    /// The shuffle is re-seeded on every call, so the three partitions drawn
    /// with the same seed are disjoint and together cover each domain.
    pub fn split(&self, split: Split, seed: u64) -> UnpairedSplit {
        let mut rng = StdRng::seed_from_u64(seed);
        let young_idx = split_indices(self.young.len(), &mut rng);
        let old_idx = split_indices(self.old.len(), &mut rng);

        let mut young: Vec<FaceRecord> = young_idx
            .get(split)
            .iter()
            .map(|&i| self.young[i].clone())
            .collect();
        let mut old: Vec<FaceRecord> = old_idx
            .get(split)
            .iter()
            .map(|&i| self.old[i].clone())
            .collect();

        // same length on both sides
        let limit = young.len().min(old.len());
        young.truncate(limit);
        old.truncate(limit);

        tracing::info!(split = %split, young = young.len(), old = old.len(), "UTK split");
        UnpairedSplit { young, old }
    }
}

/// Shuffled index partitions of one domain (80/10/10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
    pub test: Vec<usize>,
}

impl SplitIndices {
    pub fn get(&self, split: Split) -> &[usize] {
        match split {
            Split::Train => &self.train,
            Split::Valid => &self.valid,
            Split::Test => &self.test,
        }
    }
}

/// Shuffle `0..n` and cut at `floor(0.8n)` and `floor(0.9n)`.
pub fn split_indices(n: usize, rng: &mut StdRng) -> SplitIndices {
    let mut idxs: Vec<usize> = (0..n).collect();
    idxs.shuffle(rng);
    let train_end = (0.8 * n as f64) as usize;
    let valid_end = (0.9 * n as f64) as usize;
    SplitIndices {
        train: idxs[..train_end].to_vec(),
        valid: idxs[train_end..valid_end].to_vec(),
        test: idxs[valid_end..].to_vec(),
    }
}

/// One partition of the unpaired dataset.
///
/// Item `i` is `(young[i % |young|], old[i % |old|])`; no correspondence
/// between the two sides is implied.
#[derive(Debug, Clone)]
pub struct UnpairedSplit {
    pub young: Vec<FaceRecord>,
    pub old: Vec<FaceRecord>,
}

impl UnpairedSplit {
    pub fn len(&self) -> usize {
        self.young.len().max(self.old.len())
    }

    pub fn is_empty(&self) -> bool {
        self.young.is_empty() || self.old.is_empty()
    }

    /// The unpaired item at `index`, or `None` when either side is empty.
    pub fn item(&self, index: usize) -> Option<(&FaceRecord, &FaceRecord)> {
        if self.is_empty() {
            return None;
        }
        Some((
            &self.young[index % self.young.len()],
            &self.old[index % self.old.len()],
        ))
    }
}
