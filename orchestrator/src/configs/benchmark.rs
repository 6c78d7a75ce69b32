use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use comms::specs::StrategySpec;
use serde::{Deserialize, Serialize};

use crate::{
    error::{OrchestratorError, Result},
    topology::WorldSpec,
};

/// Communication backends a trainer process group may use.
pub const BACKENDS: [&str; 2] = ["gloo", "nccl"];

/// The already validated inputs of a benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub world: WorldSpec,
    /// Trainer strategy and its extra configuration.
    pub trainer: StrategySpec,
    /// Server strategy and its extra configuration.
    pub server: StrategySpec,
    /// Process group backend name.
    pub backend: String,
    /// Rendezvous file for the trainers' process group.
    pub filestore: Option<PathBuf>,
    pub epochs: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    /// Shared timeout for every remote call and phase.
    pub rpc_timeout: Duration,
    /// Seeds generated datasets whose entry does not name a seed.
    pub seed: u64,
}

impl BenchmarkConfig {
    /// Validates the configuration as a whole.
    ///
    /// # Errors
    /// `InvalidTopology` for a bad world, `InvalidConfig` for anything else.
    pub fn validate(&self) -> Result<()> {
        self.world.validate()?;

        if !BACKENDS.contains(&self.backend.as_str()) {
            return Err(OrchestratorError::InvalidConfig(format!(
                "unknown backend {:?}, expected one of {BACKENDS:?}",
                self.backend
            )));
        }

        if self.rpc_timeout.is_zero() {
            return Err(OrchestratorError::InvalidConfig(
                "rpc timeout must be greater than 0".into(),
            ));
        }

        if self.trainer.kind.is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "a trainer strategy is required".into(),
            ));
        }

        if self.world.server_count() > 0 && self.server.kind.is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "a server strategy is required when servers are configured".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BenchmarkConfig {
        BenchmarkConfig {
            world: WorldSpec::new(2, 0, 1, 0).unwrap(),
            trainer: StrategySpec::new("sgd"),
            server: StrategySpec::new("sgd"),
            backend: "gloo".into(),
            filestore: None,
            epochs: NonZeroUsize::new(1).unwrap(),
            batch_size: NonZeroUsize::new(4).unwrap(),
            rpc_timeout: Duration::from_secs(30),
            seed: 0,
        }
    }

    #[test]
    fn valid_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn unknown_backend() {
        let config = BenchmarkConfig {
            backend: "mpi".into(),
            ..config()
        };
        assert!(matches!(
            config.validate(),
            Err(OrchestratorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_timeout() {
        let config = BenchmarkConfig {
            rpc_timeout: Duration::ZERO,
            ..config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn servers_need_a_strategy() {
        let config = BenchmarkConfig {
            server: StrategySpec::new(""),
            ..config()
        };
        assert!(config.validate().is_err());
    }
}
