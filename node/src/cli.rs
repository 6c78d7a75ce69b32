use std::{num::NonZeroUsize, path::PathBuf};

use clap::Parser;

/// Command line of a benchmark node.
///
/// Without `--rank` the process is the launcher: it validates the configuration and
/// spawns one copy of itself per rank, forwarding every other argument.
#[derive(Debug, Clone, Parser)]
#[command(name = "node", version, about = "Parameter-server RPC benchmark")]
pub struct Args {
    /// Address of the machine hosting every rank's endpoint.
    #[arg(long, default_value = "127.0.0.1")]
    pub master_addr: String,

    /// Port of rank 0, rank `r` listens at `master_port + r`.
    #[arg(long, default_value_t = 29500)]
    pub master_port: u16,

    /// Trainer registry key.
    #[arg(long)]
    pub trainer: String,

    #[arg(long, default_value_t = 0)]
    pub ntrainer: usize,

    #[arg(long, default_value_t = 0)]
    pub ncudatrainer: usize,

    /// Server registry key, required when any server is configured.
    #[arg(long)]
    pub server: Option<String>,

    #[arg(long, default_value_t = 0)]
    pub nserver: usize,

    #[arg(long, default_value_t = 0)]
    pub ncudaserver: usize,

    /// Timeout in seconds for every remote call.
    #[arg(long, default_value_t = 60)]
    pub rpc_timeout: u64,

    /// Trainer process group backend.
    #[arg(long, default_value = "gloo")]
    pub backend: String,

    /// Rendezvous file for the trainers' process group.
    #[arg(long)]
    pub filestore: Option<PathBuf>,

    #[arg(long, default_value = "1")]
    pub epochs: NonZeroUsize,

    /// Number of samples per training step.
    #[arg(long, default_value = "1")]
    pub batch_size: NonZeroUsize,

    /// Id of the entry in the data configuration file.
    #[arg(long)]
    pub data: String,

    /// Id of the entry in the model configuration file.
    #[arg(long)]
    pub model: String,

    #[arg(long)]
    pub data_config_path: PathBuf,

    #[arg(long)]
    pub model_config_path: PathBuf,

    #[arg(long)]
    pub server_config_path: Option<PathBuf>,

    #[arg(long)]
    pub trainer_config_path: Option<PathBuf>,

    /// Seed for datasets that do not carry their own.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// This process's rank, set by the launcher.
    #[arg(long)]
    pub rank: Option<usize>,
}
