//! Unpaired image-to-image translation between two age domains (CycleGAN).
//!
//! Two generators (G: young→old, F: old→young) and two discriminators
//! (DX judges young images, DY judges old images) trained with adversarial,
//! cycle-consistency and identity losses. Model selection uses FID on the
//! validation split; the best model is checkpointed and evaluated on test.

pub mod model;
pub mod training;

pub use model::{CycleGanConfig, ModelQuartet};
pub use training::run::{initialize_environment, run, RunConfig, RunEnvironment, RunOutcome};
