//! Per-epoch learning-rate schedules: constant for the first half of the run,
//! then linear decay to zero at the final epoch.

use serde::{Deserialize, Serialize};

use crate::training::step::OptimizerQuartet;
use crate::training::substrate::Prepared;

/// LR multiplier at `epoch` for a run of `total_epochs`.
///
/// `1.0` while `epoch < total_epochs / 2`, then `(N - epoch) / (N - N/2)`,
/// clamped at zero.
pub fn linear_decay_multiplier(epoch: usize, total_epochs: usize) -> f64 {
    let start = total_epochs / 2;
    if epoch < start {
        return 1.0;
    }
    let span = total_epochs.saturating_sub(start);
    if span == 0 {
        return 1.0;
    }
    let remaining = total_epochs.saturating_sub(epoch) as f64;
    (remaining / span as f64).max(0.0)
}

/// One optimizer's schedule. Tracks only its own epoch counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearDecaySchedule {
    pub base_lr: f64,
    pub total_epochs: usize,
    /// Number of times `step` has been called.
    pub epoch: usize,
}

impl LinearDecaySchedule {
    pub fn new(base_lr: f64, total_epochs: usize) -> Self {
        Self {
            base_lr,
            total_epochs,
            epoch: 0,
        }
    }

    pub fn multiplier(&self) -> f64 {
        linear_decay_multiplier(self.epoch, self.total_epochs)
    }

    pub fn current_lr(&self) -> f64 {
        self.base_lr * self.multiplier()
    }

    /// Advance one epoch and return the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.current_lr()
    }
}

/// Learning rates currently applied to each of the four optimizers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRates {
    pub g: f64,
    pub f: f64,
    pub dx: f64,
    pub dy: f64,
}

impl LearningRates {
    /// Tracked keys `train/current_{G,F,DX,DY}_lr`.
    pub fn named(&self) -> [(&'static str, f64); 4] {
        [
            ("current_G_lr", self.g),
            ("current_F_lr", self.f),
            ("current_DX_lr", self.dx),
            ("current_DY_lr", self.dy),
        ]
    }
}

/// Independent schedules for G, F, DX and DY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleQuartet {
    #[serde(rename = "sched_G")]
    pub g: LinearDecaySchedule,
    #[serde(rename = "sched_F")]
    pub f: LinearDecaySchedule,
    #[serde(rename = "sched_DX")]
    pub dx: LinearDecaySchedule,
    #[serde(rename = "sched_DY")]
    pub dy: LinearDecaySchedule,
}

impl ScheduleQuartet {
    /// Build schedules for optimizers that have already been handed to the
    /// execution context.
    pub fn for_optimizers<OG, OD>(
        _optimizers: &Prepared<OptimizerQuartet<OG, OD>>,
        gen_lr: f64,
        disc_lr: f64,
        total_epochs: usize,
    ) -> Self {
        Self {
            g: LinearDecaySchedule::new(gen_lr, total_epochs),
            f: LinearDecaySchedule::new(gen_lr, total_epochs),
            dx: LinearDecaySchedule::new(disc_lr, total_epochs),
            dy: LinearDecaySchedule::new(disc_lr, total_epochs),
        }
    }

    pub fn current(&self) -> LearningRates {
        LearningRates {
            g: self.g.current_lr(),
            f: self.f.current_lr(),
            dx: self.dx.current_lr(),
            dy: self.dy.current_lr(),
        }
    }

    /// Advance all four schedules by one epoch.
    pub fn step(&mut self) -> LearningRates {
        LearningRates {
            g: self.g.step(),
            f: self.f.step(),
            dx: self.dx.step(),
            dy: self.dy.step(),
        }
    }
}
