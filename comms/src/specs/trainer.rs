use std::{num::NonZeroUsize, path::PathBuf};

use serde::{Deserialize, Serialize};

use super::{Batch, ModelState, StrategySpec};

/// Describes the collective group formed by all trainers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessGroupSpec {
    /// Communication backend name, e.g. "gloo" or "nccl".
    pub backend: String,
    /// Rendezvous file shared by the group, when one is configured.
    pub store: Option<PathBuf>,
    pub rank: usize,
    pub size: usize,
}

/// Construction arguments for a trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerSpec {
    pub rank: usize,
    /// Total trainers in the world, cpu and cuda.
    pub trainer_count: usize,
    pub process_group: ProcessGroupSpec,
    pub use_cuda_rpc: bool,
    /// The rank of the server this trainer is bound to.
    pub server: Option<usize>,
    pub backend: String,
    pub epochs: NonZeroUsize,
    pub strategy: StrategySpec,
}

/// Everything a trainer needs for one training pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerJob {
    pub spec: TrainerSpec,
    /// This trainer's own model replica.
    pub model: ModelState,
    pub shard: Vec<Batch>,
}
