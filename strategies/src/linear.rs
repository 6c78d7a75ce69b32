use comms::specs::{Batch, ModelState, StrategySpec};
use serde::Deserialize;

use crate::{
    error::{Result, StrategyError},
    params,
};

pub const LINEAR: &str = "linear";

#[derive(Debug, Deserialize)]
struct LinearParams {
    inputs: usize,
    #[serde(default)]
    init: f32,
}

/// Builds a linear model of `inputs` weights followed by a bias, all set to `init`.
pub(crate) fn build(spec: &StrategySpec) -> Result<ModelState> {
    let LinearParams { inputs, init } = params::parse(spec)?;
    if inputs == 0 {
        return Err(StrategyError::InvalidInput(
            "a linear model needs at least one input".into(),
        ));
    }

    Ok(ModelState {
        kind: LINEAR.into(),
        inputs,
        params: vec![init; inputs + 1],
    })
}

/// Checks that `model` is a well formed linear model.
pub fn check(model: &ModelState) -> Result<()> {
    if model.kind != LINEAR {
        return Err(StrategyError::InvalidInput(format!(
            "expected a {LINEAR} model, got {:?}",
            model.kind
        )));
    }

    if model.params.len() != model.inputs + 1 {
        return Err(StrategyError::ShapeMismatch {
            what: "params",
            got: model.params.len(),
            expected: model.inputs + 1,
        });
    }

    Ok(())
}

pub fn predict(params: &[f32], features: &[f32]) -> f32 {
    let (bias, weights) = match params.split_last() {
        Some(split) => split,
        None => return 0.0,
    };

    bias + weights
        .iter()
        .zip(features)
        .map(|(w, x)| w * x)
        .sum::<f32>()
}

/// Writes the mean squared error gradient of `batch` into `grad`.
///
/// # Returns
/// The batch's mean squared error before the update.
///
/// # Errors
/// `ShapeMismatch` if a sample's width or `grad`'s length does not match `params`.
pub fn gradient(params: &[f32], batch: &Batch, grad: &mut [f32]) -> Result<f32> {
    if grad.len() != params.len() {
        return Err(StrategyError::ShapeMismatch {
            what: "gradient",
            got: grad.len(),
            expected: params.len(),
        });
    }

    grad.fill(0.0);
    if batch.is_empty() {
        return Ok(0.0);
    }

    let inputs = params.len() - 1;
    let scale = 2.0 / batch.len() as f32;
    let mut loss = 0.0;

    for sample in &batch.samples {
        if sample.features.len() != inputs {
            return Err(StrategyError::ShapeMismatch {
                what: "features",
                got: sample.features.len(),
                expected: inputs,
            });
        }

        let err = predict(params, &sample.features) - sample.target;
        loss += err * err;

        for (g, x) in grad.iter_mut().zip(&sample.features) {
            *g += scale * err * x;
        }
        grad[inputs] += scale * err;
    }

    Ok(loss / batch.len() as f32)
}

/// `params -= lr * grad`
pub fn step(params: &mut [f32], grad: &[f32], lr: f32) {
    for (p, g) in params.iter_mut().zip(grad) {
        *p -= lr * g;
    }
}

#[cfg(test)]
mod tests {
    use comms::specs::Sample;
    use serde_json::json;

    use super::*;

    fn sample(features: Vec<f32>, target: f32) -> Sample {
        Sample { features, target }
    }

    #[test]
    fn build_appends_bias() {
        let spec = StrategySpec::with_params(LINEAR, json!({ "inputs": 3, "init": 0.5 }));
        let model = build(&spec).unwrap();

        assert_eq!(model.inputs, 3);
        assert_eq!(model.params, [0.5; 4]);
        check(&model).unwrap();
    }

    #[test]
    fn build_requires_inputs() {
        let err = build(&StrategySpec::new(LINEAR)).unwrap_err();
        assert!(matches!(err, StrategyError::InvalidParams { .. }));

        let spec = StrategySpec::with_params(LINEAR, json!({ "inputs": 0 }));
        assert!(matches!(build(&spec), Err(StrategyError::InvalidInput(_))));
    }

    #[test]
    fn predict_uses_bias_last() {
        assert_eq!(predict(&[2.0, -1.0, 0.5], &[3.0, 4.0]), 2.5);
    }

    #[test]
    fn gradient_of_exact_fit_is_zero() {
        let params = [2.0, 1.0];
        let batch = Batch::new(vec![sample(vec![1.0], 3.0), sample(vec![-1.0], -1.0)]);
        let mut grad = [1.0; 2];

        let loss = gradient(&params, &batch, &mut grad).unwrap();
        assert_eq!(loss, 0.0);
        assert_eq!(grad, [0.0, 0.0]);
    }

    #[test]
    fn gradient_points_away_from_target() {
        let params = [0.0, 0.0];
        let batch = Batch::new(vec![sample(vec![2.0], 1.0)]);
        let mut grad = [0.0; 2];

        let loss = gradient(&params, &batch, &mut grad).unwrap();
        assert_eq!(loss, 1.0);
        assert_eq!(grad, [-4.0, -2.0]);

        let mut params = params;
        step(&mut params, &grad, 0.1);
        assert_eq!(params, [0.4, 0.2]);
    }

    #[test]
    fn gradient_rejects_wrong_width() {
        let batch = Batch::new(vec![sample(vec![1.0, 2.0], 0.0)]);
        let err = gradient(&[0.0, 0.0], &batch, &mut [0.0; 2]).unwrap_err();
        assert!(matches!(
            err,
            StrategyError::ShapeMismatch {
                what: "features",
                got: 2,
                expected: 1
            }
        ));
    }
}
