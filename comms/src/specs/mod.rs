pub mod data;
pub mod server;
pub mod strategy;
pub mod trainer;

pub use data::{Batch, ModelState, Sample};
pub use server::ServerSpec;
pub use strategy::StrategySpec;
pub use trainer::{ProcessGroupSpec, TrainerJob, TrainerSpec};
