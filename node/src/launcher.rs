use std::{env, process::Stdio};

use anyhow::{Context, Result, bail};
use log::info;
use tokio::{process::Command, signal, task::JoinSet};

use crate::cli::Args;

/// Validates the run and starts one process per rank, waiting for all of them.
///
/// Children are killed as soon as one of them fails or the launcher is interrupted.
///
/// # Errors
/// Fails on invalid inputs, if a rank cannot be spawned or if a rank exits unsuccessfully.
pub async fn launch(args: &Args) -> Result<()> {
    let inputs = args.load()?;
    strategies::build_model(&inputs.model).context("invalid model configuration")?;
    inputs.dataset().context("invalid data configuration")?;

    let world_size = inputs.config.world.world_size();
    let exe = env::current_exe().context("failed to locate the node executable")?;
    let forwarded: Vec<_> = env::args_os().skip(1).collect();

    info!("launching {world_size} rank(s)");

    let mut ranks = JoinSet::new();
    for rank in 0..world_size {
        let mut child = Command::new(&exe)
            .args(&forwarded)
            .arg("--rank")
            .arg(rank.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn rank {rank}"))?;

        ranks.spawn(async move { (rank, child.wait().await) });
    }

    loop {
        tokio::select! {
            joined = ranks.join_next() => {
                let Some(joined) = joined else { break };
                let (rank, status) = joined?;
                let status = status.with_context(|| format!("failed to wait for rank {rank}"))?;

                if !status.success() {
                    bail!("rank {rank} exited with {status}");
                }
                info!(rank = rank; "exited");
            }
            _ = signal::ctrl_c() => bail!("interrupted"),
        }
    }

    Ok(())
}
