//! Split-namespaced scalar metrics.

use std::collections::BTreeMap;
use std::fmt;

use faces::Split;
use serde::{Deserialize, Serialize};

use crate::training::TrainError;

/// Loss keys produced by every training step and evaluation batch.
pub const LOSS_KEYS: [&str; 7] = [
    "loss_DX",
    "loss_DY",
    "loss_f_adv",
    "loss_g_adv",
    "loss_cyc",
    "loss_id",
    "loss_gen_total",
];

/// Key of the distributional score in evaluation records.
pub const FID_KEY: &str = "fid_val";

/// Step-axis key used for every tracked curve.
pub const EPOCH_FLOAT_KEY: &str = "train/epoch_float";

/// Mapping from `"<split>/<name>"` to a scalar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsRecord {
    values: BTreeMap<String, f64>,
}

impl MetricsRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// A record holding `0.0` for every loss key of `split`.
    pub fn zeroed_losses(split: Split) -> Self {
        let mut record = Self::new();
        for key in LOSS_KEYS {
            record.insert(split, key, 0.0);
        }
        record
    }

    /// Insert `"<split>/<name>"`.
    pub fn insert(&mut self, split: Split, name: &str, value: f64) {
        self.values.insert(format!("{split}/{name}"), value);
    }

    /// Insert a fully-qualified key.
    pub fn insert_raw(&mut self, key: impl Into<String>, value: f64) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, split: Split, name: &str) -> Option<f64> {
        self.values.get(&format!("{split}/{name}")).copied()
    }

    pub fn get_raw(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Add every value of `other` into `self`, key by key.
    pub fn accumulate(&mut self, other: &MetricsRecord) {
        for (k, v) in &other.values {
            *self.values.entry(k.clone()).or_insert(0.0) += v;
        }
    }

    /// Divide every value by the batch count.
    pub fn average_over(&mut self, n_batches: usize, split: Split) -> Result<(), TrainError> {
        if n_batches == 0 {
            return Err(TrainError::EmptySplit(split));
        }
        let n = n_batches as f64;
        for v in self.values.values_mut() {
            *v /= n;
        }
        Ok(())
    }

    /// Every value must be finite, or the record is unusable.
    pub fn ensure_finite(&self) -> Result<(), TrainError> {
        match self.values.iter().find(|(_, v)| !v.is_finite()) {
            Some((key, value)) => Err(TrainError::NonFiniteMetric {
                key: key.clone(),
                value: *value,
            }),
            None => Ok(()),
        }
    }
}

/// The seven per-batch losses, already weighted.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossValues {
    pub loss_dx: f64,
    pub loss_dy: f64,
    pub f_adv: f64,
    pub g_adv: f64,
    pub cycle: f64,
    pub identity: f64,
    pub gen_total: f64,
}

impl LossValues {
    /// Namespaced record with one entry per [`LOSS_KEYS`] key.
    pub fn to_record(&self, split: Split) -> MetricsRecord {
        let values = [
            self.loss_dx,
            self.loss_dy,
            self.f_adv,
            self.g_adv,
            self.cycle,
            self.identity,
            self.gen_total,
        ];
        let mut record = MetricsRecord::new();
        for (key, value) in LOSS_KEYS.iter().zip(values) {
            record.insert(split, key, value);
        }
        record
    }
}

impl fmt::Display for MetricsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.values {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "{k}: {v:.4}")?;
            first = false;
        }
        Ok(())
    }
}
