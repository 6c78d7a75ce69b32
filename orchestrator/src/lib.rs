pub mod configs;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod session;
pub mod topology;
pub mod transport;

use std::sync::Arc;

use comms::specs::{Batch, ModelState};

pub use configs::BenchmarkConfig;
pub use error::{OrchestratorError, Result};
pub use metrics::{BenchmarkReport, MetricsRecord, Report};
pub use session::{Phase, Session, State};
pub use topology::{Rank, Role, WorldSpec};
pub use transport::{RemoteHandle, Transport};

/// Runs a whole benchmark from the master and releases the transport afterwards.
///
/// The transport is shut down whether the run succeeds or not, so that every other
/// rank leaves its serving loop.
///
/// # Errors
/// Returns an `OrchestratorError` if the configuration is invalid or any phase fails.
pub async fn benchmark<T: Transport>(
    transport: Arc<T>,
    config: BenchmarkConfig,
    model: &ModelState,
    batches: Vec<Batch>,
) -> Result<BenchmarkReport> {
    log::info!(
        "running benchmark over {} trainer(s) and {} server(s)",
        config.world.trainer_count(),
        config.world.server_count()
    );

    let result = match Session::new(transport.clone(), config) {
        Ok(mut session) => session.run(model, batches).await,
        Err(e) => Err(e),
    };

    if let Err(e) = transport.shutdown().await {
        log::warn!("failed to shut down the transport: {e}");
    }

    result
}
