use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use comms::specs::{Batch, ModelState, StrategySpec};
use log::debug;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    error::{Result, StrategyError},
    linear, params,
};

/// A trainer's connection to the parameter server it is bound to.
#[async_trait::async_trait]
pub trait ParameterLink: Send + Sync {
    /// Offers `params` to the server and returns the parameters to start from.
    async fn init_params(&self, params: Vec<f32>) -> Result<Vec<f32>>;

    /// Pushes `gradient` and returns the server's updated parameters.
    async fn push_gradient(&self, gradient: Vec<f32>) -> Result<Vec<f32>>;
}

/// A local training computation run by a trainer rank.
///
/// The trainer owns its model replica for the duration of one pass over its shard. The
/// pass is repeated `epochs` times.
#[async_trait::async_trait]
pub trait TrainerStrategy: Send {
    /// Trains `model` over `shard`, talking to the parameter server through `link` when
    /// the trainer is bound to one.
    ///
    /// # Errors
    /// `InvalidInput` or `ShapeMismatch` for a malformed model or shard, `Link` if the
    /// server fails.
    async fn train(
        &mut self,
        model: &ModelState,
        shard: &[Batch],
        epochs: NonZeroUsize,
        link: Option<&dyn ParameterLink>,
    ) -> Result<()>;

    /// Statistics of the last `train` call.
    fn metrics(&self) -> Value;
}

/// Builds the trainer named by `spec.kind`.
///
/// # Errors
/// `UnknownKind` for an unregistered kind, `InvalidParams` for undecodable parameters.
pub fn from_spec(spec: &StrategySpec) -> Result<Trainer> {
    Ok(match spec.kind.as_str() {
        "sgd" => {
            let SgdParams { lr } = params::parse(spec)?;
            Trainer::Sgd(SgdTrainer::new(lr))
        }
        "noop" => Trainer::Noop(NoopTrainer::default()),
        kind => {
            return Err(StrategyError::UnknownKind {
                registry: "trainer",
                kind: kind.into(),
            });
        }
    })
}

pub enum Trainer {
    Sgd(SgdTrainer),
    Noop(NoopTrainer),
}

impl Trainer {
    pub fn kind(&self) -> &'static str {
        match self {
            Trainer::Sgd(_) => "sgd",
            Trainer::Noop(_) => "noop",
        }
    }
}

#[async_trait::async_trait]
impl TrainerStrategy for Trainer {
    async fn train(
        &mut self,
        model: &ModelState,
        shard: &[Batch],
        epochs: NonZeroUsize,
        link: Option<&dyn ParameterLink>,
    ) -> Result<()> {
        match self {
            Trainer::Sgd(t) => t.train(model, shard, epochs, link).await,
            Trainer::Noop(t) => t.train(model, shard, epochs, link).await,
        }
    }

    fn metrics(&self) -> Value {
        match self {
            Trainer::Sgd(t) => t.metrics(),
            Trainer::Noop(t) => t.metrics(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SgdParams {
    #[serde(default = "params::default_lr")]
    lr: f32,
}

#[derive(Debug, Default, Clone, Copy)]
struct SgdStats {
    batches: usize,
    samples: usize,
    epochs: usize,
    compute: Duration,
    comm: Duration,
    elapsed: Duration,
    final_loss: Option<f32>,
}

/// Mini-batch gradient descent on a linear model.
pub struct SgdTrainer {
    lr: f32,
    params: Vec<f32>,
    stats: SgdStats,
}

impl SgdTrainer {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            params: Vec::new(),
            stats: SgdStats::default(),
        }
    }

    /// The parameters reached by the last `train` call.
    pub fn params(&self) -> &[f32] {
        &self.params
    }

    fn adopt(&mut self, params: Vec<f32>) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(StrategyError::ShapeMismatch {
                what: "server params",
                got: params.len(),
                expected: self.params.len(),
            });
        }
        self.params = params;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TrainerStrategy for SgdTrainer {
    async fn train(
        &mut self,
        model: &ModelState,
        shard: &[Batch],
        epochs: NonZeroUsize,
        link: Option<&dyn ParameterLink>,
    ) -> Result<()> {
        linear::check(model)?;
        self.stats = SgdStats::default();
        self.params = model.params.clone();

        let start = Instant::now();
        if let Some(link) = link {
            let params = link.init_params(self.params.clone()).await?;
            self.adopt(params)?;
        }
        self.stats.comm += start.elapsed();

        let mut grad = vec![0.0; self.params.len()];
        for epoch in 0..epochs.get() {
            let mut epoch_loss = 0.0;

            for batch in shard {
                let t = Instant::now();
                let loss = linear::gradient(&self.params, batch, &mut grad)?;
                if link.is_none() {
                    linear::step(&mut self.params, &grad, self.lr);
                }
                self.stats.compute += t.elapsed();

                if let Some(link) = link {
                    let t = Instant::now();
                    let params = link.push_gradient(grad.clone()).await?;
                    self.stats.comm += t.elapsed();
                    self.adopt(params)?;
                }

                epoch_loss += loss;
                self.stats.batches += 1;
                self.stats.samples += batch.len();
                self.stats.final_loss = Some(loss);
            }

            self.stats.epochs += 1;
            if !shard.is_empty() {
                debug!(epoch = epoch; "mean loss {}", epoch_loss / shard.len() as f32);
            }
        }

        self.stats.elapsed = start.elapsed();
        Ok(())
    }

    fn metrics(&self) -> Value {
        let SgdStats {
            batches,
            samples,
            epochs,
            compute,
            comm,
            elapsed,
            final_loss,
        } = self.stats;

        let elapsed = elapsed.as_secs_f64();
        let throughput = if elapsed > 0.0 {
            samples as f64 / elapsed
        } else {
            0.0
        };

        json!({
            "batches": batches,
            "samples": samples,
            "epochs": epochs,
            "compute_secs": compute.as_secs_f64(),
            "comm_secs": comm.as_secs_f64(),
            "elapsed_secs": elapsed,
            "final_loss": final_loss,
            "samples_per_sec": throughput,
        })
    }
}

/// Walks the shard without computing anything.
#[derive(Default)]
pub struct NoopTrainer {
    batches: usize,
    samples: usize,
}

#[async_trait::async_trait]
impl TrainerStrategy for NoopTrainer {
    async fn train(
        &mut self,
        _model: &ModelState,
        shard: &[Batch],
        epochs: NonZeroUsize,
        _link: Option<&dyn ParameterLink>,
    ) -> Result<()> {
        let per_epoch: usize = shard.iter().map(Batch::len).sum();
        self.batches = shard.len() * epochs.get();
        self.samples = per_epoch * epochs.get();
        Ok(())
    }

    fn metrics(&self) -> Value {
        json!({ "batches": self.batches, "samples": self.samples })
    }
}

#[cfg(test)]
mod tests {
    use comms::specs::{Sample, ServerSpec};
    use parking_lot::Mutex;

    use super::*;
    use crate::server::{self, Server, ServerStrategy};

    /// Forwards calls straight into an in-process server.
    struct LocalLink {
        trainer: usize,
        server: Mutex<Server>,
    }

    #[async_trait::async_trait]
    impl ParameterLink for LocalLink {
        async fn init_params(&self, params: Vec<f32>) -> Result<Vec<f32>> {
            self.server.lock().init_params(self.trainer, params)
        }

        async fn push_gradient(&self, gradient: Vec<f32>) -> Result<Vec<f32>> {
            self.server.lock().push_gradient(self.trainer, &gradient)
        }
    }

    fn model() -> ModelState {
        ModelState {
            kind: "linear".into(),
            inputs: 1,
            params: vec![0.0, 0.0],
        }
    }

    /// y = 2x + 1
    fn shard() -> Vec<Batch> {
        (0..8)
            .map(|i| {
                let x = i as f32 / 8.0;
                Batch::new(vec![Sample {
                    features: vec![x],
                    target: 2.0 * x + 1.0,
                }])
            })
            .collect()
    }

    fn epochs(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn local_sgd_reduces_loss() {
        let spec = StrategySpec::with_params("sgd", json!({ "lr": 0.2 }));
        let mut trainer = from_spec(&spec).unwrap();
        trainer.train(&model(), &shard(), epochs(1), None).await.unwrap();
        let first = trainer.metrics()["final_loss"].as_f64().unwrap();

        trainer.train(&model(), &shard(), epochs(50), None).await.unwrap();
        let metrics = trainer.metrics();

        assert!(metrics["final_loss"].as_f64().unwrap() < first);
        assert_eq!(metrics["batches"], 400);
        assert_eq!(metrics["samples"], 400);
        assert_eq!(metrics["epochs"], 50);
    }

    #[tokio::test]
    async fn bound_trainer_follows_the_server() {
        let spec = ServerSpec {
            rank: 1,
            trainer_count: 1,
            use_cuda_rpc: false,
            strategy: StrategySpec::with_params("sgd", json!({ "lr": 0.2 })),
        };
        let link = LocalLink {
            trainer: 0,
            server: Mutex::new(server::from_spec(&spec).unwrap()),
        };

        let mut trainer = SgdTrainer::new(0.0);
        trainer.train(&model(), &shard(), epochs(2), Some(&link)).await.unwrap();

        let server = link.server.lock();
        assert_eq!(server.metrics()["updates"], 16);
        assert_ne!(trainer.params(), model().params.as_slice());
    }

    #[tokio::test]
    async fn noop_counts_work() {
        let mut trainer = from_spec(&StrategySpec::new("noop")).unwrap();
        assert_eq!(trainer.kind(), "noop");

        trainer.train(&model(), &shard(), epochs(3), None).await.unwrap();
        assert_eq!(trainer.metrics(), json!({ "batches": 24, "samples": 24 }));
    }

    #[tokio::test]
    async fn sgd_rejects_other_models() {
        let mut model = model();
        model.kind = "mlp".into();

        let mut trainer = SgdTrainer::new(0.1);
        let err = trainer.train(&model, &shard(), epochs(1), None).await.unwrap_err();
        assert!(matches!(err, StrategyError::InvalidInput(_)));
    }

    #[test]
    fn unknown_kind() {
        let err = from_spec(&StrategySpec::new("adam")).err().unwrap();
        assert!(matches!(err, StrategyError::UnknownKind { registry: "trainer", .. }));
    }
}
