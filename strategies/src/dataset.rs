use comms::specs::{Sample, StrategySpec};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Deserialize;

use crate::{
    error::{Result, StrategyError},
    params,
};

pub const SYNTHETIC_LINEAR: &str = "synthetic_linear";

#[derive(Debug, Deserialize)]
struct SyntheticLinearParams {
    samples: usize,
    features: usize,
    #[serde(default)]
    noise: f32,
    #[serde(default)]
    seed: u64,
}

/// Draws `samples` examples of a hidden linear function of `features` inputs.
///
/// The hidden weights, the inputs and the noise all come from one `StdRng` seeded with
/// `seed`, so equal parameters always produce the same dataset.
pub(crate) fn synthetic_linear(spec: &StrategySpec) -> Result<Vec<Sample>> {
    let SyntheticLinearParams {
        samples,
        features,
        noise,
        seed,
    } = params::parse(spec)?;

    if features == 0 {
        return Err(StrategyError::InvalidInput(
            "a dataset needs at least one feature".into(),
        ));
    }
    if !noise.is_finite() || noise < 0.0 {
        return Err(StrategyError::InvalidInput(format!(
            "noise must be a non-negative number, got {noise}"
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let weights: Vec<f32> = (0..features).map(|_| rng.random_range(-1.0..1.0)).collect();
    let bias: f32 = rng.random_range(-1.0..1.0);

    let data = (0..samples)
        .map(|_| {
            let x: Vec<f32> = (0..features).map(|_| rng.random_range(-1.0..1.0)).collect();
            let clean = bias + weights.iter().zip(&x).map(|(w, x)| w * x).sum::<f32>();
            let jitter = if noise > 0.0 {
                rng.random_range(-noise..noise)
            } else {
                0.0
            };

            Sample {
                features: x,
                target: clean + jitter,
            }
        })
        .collect();

    Ok(data)
}
