use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use comms::specs::ServerSpec;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    error::{Result, StrategyError},
    params,
};

/// The parameter-holding side of a run, hosted on a server rank.
///
/// Every call names the trainer it comes from so implementations can keep per-trainer
/// accounting. All methods return the parameters the trainer should continue from.
pub trait ServerStrategy: Send {
    /// Offers a trainer's initial parameters. The first offer after construction or a
    /// reset wins, later ones receive the stored parameters.
    fn init_params(&mut self, trainer: usize, params: Vec<f32>) -> Result<Vec<f32>>;

    /// Applies a trainer's gradient.
    ///
    /// # Errors
    /// `InvalidInput` if no parameters were offered yet or `trainer` is one too many,
    /// `ShapeMismatch` if `gradient` does not match the parameters.
    fn push_gradient(&mut self, trainer: usize, gradient: &[f32]) -> Result<Vec<f32>>;

    /// Clears parameters and counters between the warmup and the measured pass.
    fn reset_state(&mut self);

    /// Counters gathered since the last reset.
    fn metrics(&self) -> Value;
}

/// Builds the server named by `spec.strategy.kind`.
///
/// # Errors
/// `UnknownKind` for an unregistered kind, `InvalidParams` for undecodable parameters.
pub fn from_spec(spec: &ServerSpec) -> Result<Server> {
    let strategy = &spec.strategy;
    Ok(match strategy.kind.as_str() {
        "sgd" => {
            let SgdParams { lr } = params::parse(strategy)?;
            Server::Sgd(SgdServer::new(spec.trainer_count, lr))
        }
        "noop" => Server::Noop(NoopServer::default()),
        kind => {
            return Err(StrategyError::UnknownKind {
                registry: "server",
                kind: kind.into(),
            });
        }
    })
}

pub enum Server {
    Sgd(SgdServer),
    Noop(NoopServer),
}

impl Server {
    pub fn kind(&self) -> &'static str {
        match self {
            Server::Sgd(_) => "sgd",
            Server::Noop(_) => "noop",
        }
    }
}

impl ServerStrategy for Server {
    fn init_params(&mut self, trainer: usize, params: Vec<f32>) -> Result<Vec<f32>> {
        match self {
            Server::Sgd(s) => s.init_params(trainer, params),
            Server::Noop(s) => s.init_params(trainer, params),
        }
    }

    fn push_gradient(&mut self, trainer: usize, gradient: &[f32]) -> Result<Vec<f32>> {
        match self {
            Server::Sgd(s) => s.push_gradient(trainer, gradient),
            Server::Noop(s) => s.push_gradient(trainer, gradient),
        }
    }

    fn reset_state(&mut self) {
        match self {
            Server::Sgd(s) => s.reset_state(),
            Server::Noop(s) => s.reset_state(),
        }
    }

    fn metrics(&self) -> Value {
        match self {
            Server::Sgd(s) => s.metrics(),
            Server::Noop(s) => s.metrics(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SgdParams {
    #[serde(default = "params::default_lr")]
    lr: f32,
}

/// Applies every pushed gradient to a single shared parameter vector.
pub struct SgdServer {
    lr: f32,
    /// How many distinct trainers are bound to this server.
    trainer_count: usize,
    params: Option<Vec<f32>>,
    /// Updates per trainer rank.
    updates: BTreeMap<usize, usize>,
    busy: Duration,
}

impl SgdServer {
    pub fn new(trainer_count: usize, lr: f32) -> Self {
        Self {
            lr,
            trainer_count,
            params: None,
            updates: BTreeMap::new(),
            busy: Duration::ZERO,
        }
    }

    fn check_trainer(&mut self, trainer: usize) -> Result<()> {
        if !self.updates.contains_key(&trainer) {
            if self.updates.len() == self.trainer_count {
                return Err(StrategyError::InvalidInput(format!(
                    "trainer {trainer} exceeds the {} trainers bound to this server",
                    self.trainer_count
                )));
            }
            self.updates.insert(trainer, 0);
        }
        Ok(())
    }
}

impl ServerStrategy for SgdServer {
    fn init_params(&mut self, trainer: usize, params: Vec<f32>) -> Result<Vec<f32>> {
        self.check_trainer(trainer)?;
        Ok(self.params.get_or_insert(params).clone())
    }

    fn push_gradient(&mut self, trainer: usize, gradient: &[f32]) -> Result<Vec<f32>> {
        self.check_trainer(trainer)?;
        let start = Instant::now();

        let params = self
            .params
            .as_mut()
            .ok_or_else(|| StrategyError::InvalidInput("parameters were never offered".into()))?;

        if gradient.len() != params.len() {
            return Err(StrategyError::ShapeMismatch {
                what: "gradient",
                got: gradient.len(),
                expected: params.len(),
            });
        }

        crate::linear::step(params, gradient, self.lr);
        let params = params.clone();

        *self.updates.entry(trainer).or_default() += 1;
        self.busy += start.elapsed();
        Ok(params)
    }

    fn reset_state(&mut self) {
        self.params = None;
        self.updates.clear();
        self.busy = Duration::ZERO;
    }

    fn metrics(&self) -> Value {
        json!({
            "updates": self.updates.values().sum::<usize>(),
            "updates_per_trainer": self.updates,
            "busy_secs": self.busy.as_secs_f64(),
        })
    }
}

/// Stores the first offered parameters and never changes them.
#[derive(Default)]
pub struct NoopServer {
    params: Vec<f32>,
    calls: usize,
}

impl ServerStrategy for NoopServer {
    fn init_params(&mut self, _trainer: usize, params: Vec<f32>) -> Result<Vec<f32>> {
        self.calls += 1;
        if self.params.is_empty() {
            self.params = params;
        }
        Ok(self.params.clone())
    }

    fn push_gradient(&mut self, _trainer: usize, _gradient: &[f32]) -> Result<Vec<f32>> {
        self.calls += 1;
        Ok(self.params.clone())
    }

    fn reset_state(&mut self) {
        self.params.clear();
        self.calls = 0;
    }

    fn metrics(&self) -> Value {
        json!({ "calls": self.calls })
    }
}

#[cfg(test)]
mod tests {
    use comms::specs::StrategySpec;

    use super::*;

    fn spec(kind: &str, params: Value) -> ServerSpec {
        ServerSpec {
            rank: 2,
            trainer_count: 2,
            use_cuda_rpc: false,
            strategy: StrategySpec::with_params(kind, params),
        }
    }

    #[test]
    fn first_offer_wins() {
        let mut server = from_spec(&spec("sgd", Value::Null)).unwrap();

        assert_eq!(server.init_params(0, vec![1.0, 2.0]).unwrap(), [1.0, 2.0]);
        assert_eq!(server.init_params(1, vec![9.0, 9.0]).unwrap(), [1.0, 2.0]);
    }

    #[test]
    fn gradients_are_applied_and_counted() {
        let mut server = from_spec(&spec("sgd", json!({ "lr": 0.5 }))).unwrap();
        server.init_params(0, vec![1.0, 1.0]).unwrap();

        assert_eq!(server.push_gradient(0, &[2.0, 0.0]).unwrap(), [0.0, 1.0]);
        assert_eq!(server.push_gradient(1, &[0.0, -2.0]).unwrap(), [0.0, 2.0]);
        assert_eq!(server.push_gradient(1, &[0.0, 0.0]).unwrap(), [0.0, 2.0]);

        let metrics = server.metrics();
        assert_eq!(metrics["updates"], 3);
        assert_eq!(metrics["updates_per_trainer"], json!({ "0": 1, "1": 2 }));
    }

    #[test]
    fn reset_clears_everything() {
        let mut server = from_spec(&spec("sgd", Value::Null)).unwrap();
        server.init_params(0, vec![1.0]).unwrap();
        server.push_gradient(0, &[1.0]).unwrap();

        server.reset_state();

        assert_eq!(server.metrics()["updates"], 0);
        assert!(matches!(
            server.push_gradient(0, &[1.0]),
            Err(StrategyError::InvalidInput(_))
        ));
        assert_eq!(server.init_params(1, vec![3.0]).unwrap(), [3.0]);
    }

    #[test]
    fn rejects_bad_calls() {
        let mut server = from_spec(&spec("sgd", Value::Null)).unwrap();
        server.init_params(4, vec![1.0, 1.0]).unwrap();
        server.init_params(5, vec![1.0, 1.0]).unwrap();
        assert!(matches!(
            server.init_params(6, vec![1.0, 1.0]),
            Err(StrategyError::InvalidInput(_))
        ));

        assert!(matches!(
            server.push_gradient(4, &[1.0]),
            Err(StrategyError::ShapeMismatch { got: 1, expected: 2, .. })
        ));
    }

    #[test]
    fn noop_keeps_params() {
        let mut server = from_spec(&spec("noop", Value::Null)).unwrap();
        assert_eq!(server.kind(), "noop");

        server.init_params(0, vec![1.0]).unwrap();
        assert_eq!(server.push_gradient(0, &[5.0]).unwrap(), [1.0]);
        assert_eq!(server.metrics(), json!({ "calls": 2 }));
    }

    #[test]
    fn unknown_kind() {
        let err = from_spec(&spec("adam", Value::Null)).err().unwrap();
        assert!(matches!(err, StrategyError::UnknownKind { registry: "server", .. }));
    }
}
