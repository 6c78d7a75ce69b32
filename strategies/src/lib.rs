//! Pluggable pieces of a benchmark run, looked up by string key: models, datasets,
//! trainers and parameter servers.

mod dataset;
mod error;
pub mod linear;
mod params;
pub mod server;
pub mod trainer;

use comms::specs::{ModelState, Sample, StrategySpec};

pub use error::{Result, StrategyError};
pub use server::{Server, ServerStrategy};
pub use trainer::{ParameterLink, Trainer, TrainerStrategy};

/// Builds the initial model named by `spec.kind`.
///
/// # Errors
/// `UnknownKind` for an unregistered kind, `InvalidParams` or `InvalidInput` for bad
/// parameters.
pub fn build_model(spec: &StrategySpec) -> Result<ModelState> {
    match spec.kind.as_str() {
        linear::LINEAR => linear::build(spec),
        kind => Err(StrategyError::UnknownKind {
            registry: "model",
            kind: kind.into(),
        }),
    }
}

/// Builds the full dataset named by `spec.kind`.
///
/// # Errors
/// `UnknownKind` for an unregistered kind, `InvalidParams` or `InvalidInput` for bad
/// parameters.
pub fn build_dataset(spec: &StrategySpec) -> Result<Vec<Sample>> {
    match spec.kind.as_str() {
        dataset::SYNTHETIC_LINEAR => dataset::synthetic_linear(spec),
        kind => Err(StrategyError::UnknownKind {
            registry: "dataset",
            kind: kind.into(),
        }),
    }
}
