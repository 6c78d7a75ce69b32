pub mod cli;
pub mod config;
pub mod launcher;
pub mod link;
pub mod service;

use std::sync::Arc;

use anyhow::Result;
use log::info;
use orchestrator::{
    BenchmarkReport, Role, partition, topology,
    transport::{Endpoints, RpcAgent},
};

use crate::{cli::Args, config::Inputs, service::NodeService};

/// Runs rank `rank` of the world described by `args` until the master releases it.
///
/// # Errors
/// Fails on invalid inputs, if the endpoint cannot be bound, or on the master if the
/// benchmark fails.
pub async fn run(args: &Args, rank: usize) -> Result<()> {
    let inputs = args.load()?;
    let world = &inputs.config.world;

    let role = topology::resolve_role(rank, world)?;
    let name = topology::process_name(rank, world)?;
    info!(rank = rank; "starting as {name} ({role})");

    let endpoints = Endpoints::contiguous(&args.master_addr, args.master_port, world.world_size())?;
    let agent = Arc::new(RpcAgent::init(rank, endpoints).await?);

    match role {
        Role::Master => {
            let report = run_master(agent, inputs).await?;
            print_report(&report)?;
        }
        _ => {
            let service = Arc::new(NodeService::new(agent.clone(), inputs.config.rpc_timeout));
            agent.serve(service).await?;
        }
    }

    info!(rank = rank; "{name} done");
    Ok(())
}

/// Builds the model and the dataset and drives the benchmark.
pub async fn run_master(agent: Arc<RpcAgent>, inputs: Inputs) -> Result<BenchmarkReport> {
    let model = strategies::build_model(&inputs.model)?;
    let samples = inputs.dataset()?;
    let batches = partition::into_batches(samples, inputs.config.batch_size);

    let report = orchestrator::benchmark(agent, inputs.config, &model, batches).await?;
    Ok(report)
}

fn print_report(report: &BenchmarkReport) -> Result<()> {
    for report in [&report.trainers, &report.servers] {
        println!("{}", report.label);
        for record in &report.records {
            println!("  rank {}: {}", record.rank, serde_json::to_string(&record.payload)?);
        }
        println!();
    }
    Ok(())
}
