use serde::{Deserialize, Serialize};

use super::StrategySpec;

/// Construction arguments for a parameter server, sent by the master while binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// The server's own rank.
    pub rank: usize,
    /// How many trainers push to this server.
    pub trainer_count: usize,
    /// Whether the server sits on the device-affine (cuda) side of the world.
    pub use_cuda_rpc: bool,
    pub strategy: StrategySpec,
}
