use anyhow::Result;
use clap::Parser;

use node::{cli::Args, launcher};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.rank {
        Some(rank) => node::run(&args, rank).await,
        None => launcher::launch(&args).await,
    }
}
