use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    io,
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use comms::{
    msg::{Call, Request},
    specs::{Batch, ModelState, ProcessGroupSpec, ServerSpec, TrainerJob, TrainerSpec},
};
use log::{debug, error, info};
use serde_json::Value;
use tokio::{task::JoinSet, time::Instant};

use crate::{
    configs::BenchmarkConfig,
    error::{OrchestratorError, Result},
    metrics::{BenchmarkReport, MetricsRecord, aggregate},
    partition::partition,
    topology::{Rank, resolve_affinity, resolve_role},
    transport::{PendingCall, RemoteHandle, Transport},
};

/// The states of the master's control loop.
///
/// Transitions only move forward. Any failure lands in the terminal `Failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    ServersBound,
    WarmupDispatched,
    WarmupComplete,
    MeasuredDispatched,
    MeasuredComplete,
    MetricsCollected,
    Done,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The two training passes of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Unmeasured pass priming the call paths, its metrics are dropped.
    Warmup,
    /// The timed pass whose metrics are reported.
    Measured,
}

/// The in-flight trainer calls of one phase.
pub struct PendingCalls {
    phase: Phase,
    ranks: Vec<Rank>,
    tasks: JoinSet<(Rank, Result<Value>)>,
}

impl PendingCalls {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            ranks: Vec::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Starts driving `call` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn push(&mut self, call: PendingCall) {
        let (rank, reply) = call.into_parts();
        self.ranks.push(rank);
        self.tasks.spawn(async move { (rank, reply.await) });
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The callee ranks in dispatch order.
    pub fn ranks(&self) -> &[Rank] {
        &self.ranks
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}

/// Waits until every pending call completes or `timeout` elapses.
///
/// Completion order is irrelevant, results come back sorted by rank. Calls still in
/// flight when this returns an error are aborted.
///
/// # Errors
/// `RpcTimeout` naming every stalled rank, or the first error any call replied with.
pub async fn await_all(pending: PendingCalls, timeout: Duration) -> Result<Vec<(Rank, Value)>> {
    let ranks = pending.ranks;
    let mut tasks = pending.tasks;

    let deadline = Instant::now() + timeout;
    let mut results = Vec::with_capacity(ranks.len());
    let mut expired = BTreeSet::new();

    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(None) => break,
            Ok(Some(Ok((rank, Ok(value))))) => results.push((rank, value)),
            // A call's own timer may fire before the shared deadline, the rank stays
            // pending so the whole stalled set gets reported together.
            Ok(Some(Ok((rank, Err(OrchestratorError::RpcTimeout { .. }))))) => {
                expired.insert(rank);
            }
            Ok(Some(Ok((_, Err(e))))) => return Err(e),
            Ok(Some(Err(e))) => return Err(OrchestratorError::Io(io::Error::other(e))),
            Err(_) => {
                let done: BTreeSet<_> = results.iter().map(|(rank, _)| *rank).collect();
                let stalled = ranks.into_iter().filter(|r| !done.contains(r)).collect();
                return Err(OrchestratorError::RpcTimeout {
                    ranks: stalled,
                    timeout,
                });
            }
        }
    }

    if !expired.is_empty() {
        return Err(OrchestratorError::RpcTimeout {
            ranks: expired.into_iter().collect(),
            timeout,
        });
    }

    results.sort_by_key(|(rank, _)| *rank);
    Ok(results)
}

/// The master's side of a benchmark run.
pub struct Session<T: Transport> {
    transport: Arc<T>,
    config: BenchmarkConfig,
    state: State,
    servers: BTreeMap<Rank, RemoteHandle>,
    servers_reset: bool,
}

impl<T: Transport> Session<T> {
    /// Creates a new `Session`.
    ///
    /// # Arguments
    /// * `transport` - The master's registered transport.
    /// * `config` - The run configuration.
    ///
    /// # Errors
    /// Returns the validation error of `config`.
    pub fn new(transport: Arc<T>, config: BenchmarkConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            transport,
            config,
            state: State::Init,
            servers: BTreeMap::new(),
            servers_reset: false,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The bound servers, keyed by rank.
    pub fn servers(&self) -> &BTreeMap<Rank, RemoteHandle> {
        &self.servers
    }

    /// Runs the whole benchmark: bind, warmup, reset, measured pass and collection.
    ///
    /// A world without trainers dispatches nothing and reports empty metrics.
    ///
    /// # Arguments
    /// * `model` - The model every trainer gets an independent replica of.
    /// * `batches` - The batched dataset, split round-robin across trainers.
    ///
    /// # Returns
    /// The trainer and server reports of the measured pass.
    pub async fn run(
        &mut self,
        model: &ModelState,
        batches: Vec<Batch>,
    ) -> Result<BenchmarkReport> {
        let shards = match NonZeroUsize::new(self.config.world.trainer_count()) {
            Some(trainers) => partition(batches, trainers),
            None => Vec::new(),
        };

        self.bind_servers().await?;

        let pending = self.dispatch_trainers(Phase::Warmup, model, &shards)?;
        self.await_phase(pending).await?;
        self.reset_servers().await?;
        info!("benchmark warmup done");

        let pending = self.dispatch_trainers(Phase::Measured, model, &shards)?;
        let trainer_records: Vec<_> = self
            .await_phase(pending)
            .await?
            .into_iter()
            .map(|(rank, payload)| MetricsRecord::new(rank, payload))
            .collect();

        let server_records = self.collect_server_metrics().await?;

        let report = BenchmarkReport {
            trainers: aggregate(&trainer_records, "trainer"),
            servers: aggregate(&server_records, "parameter server"),
        };

        self.state = State::Done;
        info!("benchmark done");
        Ok(report)
    }

    /// Constructs a server on every server rank.
    ///
    /// Either every server binds or the session fails, no partial topology is kept.
    pub async fn bind_servers(&mut self) -> Result<()> {
        self.require(&[State::Init], "bind servers")?;
        let result = self.try_bind_servers().await;
        if result.is_err() {
            self.servers.clear();
        }
        self.settle(result, State::ServersBound)
    }

    async fn try_bind_servers(&mut self) -> Result<()> {
        let world = self.config.world;
        let timeout = self.config.rpc_timeout;

        for rank in world.server_ranks() {
            let role = resolve_role(rank, &world)?;
            let trainer_count = world.trainers_per_server(role).unwrap_or_default();

            let spec = ServerSpec {
                rank,
                trainer_count,
                use_cuda_rpc: role.uses_device_affinity(),
                strategy: self.config.server.clone(),
            };

            let handle = self.transport.remote_bind(spec, timeout).await?;
            debug!(rank = rank; "bound {}", handle.name());
            self.servers.insert(rank, handle);
        }

        info!("bound {} server(s)", self.servers.len());
        Ok(())
    }

    /// Issues one training call per trainer without waiting for any of them.
    ///
    /// Every trainer receives its own copy of `model` and its own shard. When no servers
    /// are bound the trainers run without a server.
    ///
    /// # Arguments
    /// * `phase` - The pass being dispatched.
    /// * `model` - The model to replicate.
    /// * `shards` - One shard per trainer, indexed by trainer rank.
    pub fn dispatch_trainers(
        &mut self,
        phase: Phase,
        model: &ModelState,
        shards: &[Vec<Batch>],
    ) -> Result<PendingCalls> {
        let (from, to) = match phase {
            Phase::Warmup => (State::ServersBound, State::WarmupDispatched),
            Phase::Measured => (State::WarmupComplete, State::MeasuredDispatched),
        };
        self.require(&[from], "dispatch trainers")?;

        if phase == Phase::Measured && !self.servers_reset {
            let e = OrchestratorError::InvalidState("servers were not reset after warmup".into());
            return self.settle(Err(e), to);
        }

        let result = self.try_dispatch_trainers(phase, model, shards);
        self.settle(result, to)
    }

    fn try_dispatch_trainers(
        &self,
        phase: Phase,
        model: &ModelState,
        shards: &[Vec<Batch>],
    ) -> Result<PendingCalls> {
        let world = self.config.world;
        let timeout = self.config.rpc_timeout;
        let trainer_count = world.trainer_count();

        if shards.len() != trainer_count {
            return Err(OrchestratorError::InvalidConfig(format!(
                "got {} shards for {trainer_count} trainers",
                shards.len()
            )));
        }

        let mut pending = PendingCalls::new(phase);

        for (rank, shard) in world.trainer_ranks().zip(shards) {
            let use_cuda_rpc = resolve_role(rank, &world)?.uses_device_affinity();

            let server = if self.servers.is_empty() {
                None
            } else {
                match resolve_affinity(rank, &world)? {
                    Some(server) => Some(self.server_handle(server)?.rank()),
                    None => None,
                }
            };

            let spec = TrainerSpec {
                rank,
                trainer_count,
                process_group: ProcessGroupSpec {
                    backend: self.config.backend.clone(),
                    store: self.config.filestore.clone(),
                    rank,
                    size: trainer_count,
                },
                use_cuda_rpc,
                server,
                backend: self.config.backend.clone(),
                epochs: self.config.epochs,
                strategy: self.config.trainer.clone(),
            };

            let job = TrainerJob {
                spec,
                model: model.clone(),
                shard: shard.clone(),
            };

            let request = Request {
                call: Call::RunTrainer(Box::new(job)),
                device_affinity: use_cuda_rpc,
            };

            pending.push(self.transport.call_async(rank, request, timeout));
        }

        debug!("dispatched {} trainer(s) for {phase:?}", pending.len());
        Ok(pending)
    }

    /// Joins the calls of the current phase.
    ///
    /// # Returns
    /// Every trainer's reply, sorted by rank.
    pub async fn await_phase(&mut self, pending: PendingCalls) -> Result<Vec<(Rank, Value)>> {
        let to = match pending.phase() {
            Phase::Warmup => State::WarmupComplete,
            Phase::Measured => State::MeasuredComplete,
        };
        let from = match pending.phase() {
            Phase::Warmup => State::WarmupDispatched,
            Phase::Measured => State::MeasuredDispatched,
        };
        self.require(&[from], "await trainers")?;

        let result = await_all(pending, self.config.rpc_timeout).await;
        self.settle(result, to)
    }

    /// Clears the accumulated state of every server after the warmup pass.
    pub async fn reset_servers(&mut self) -> Result<()> {
        self.require(&[State::WarmupComplete], "reset servers")?;

        let timeout = self.config.rpc_timeout;
        let mut result = Ok(());
        for handle in self.servers.values() {
            let request = handle.request(Call::ResetState);
            if let Err(e) = self.transport.call_sync(handle.rank(), request, timeout).await {
                result = Err(e);
                break;
            }
        }

        if result.is_ok() {
            self.servers_reset = true;
        }
        self.settle(result, State::WarmupComplete)
    }

    /// Pulls the metrics of every server, in ascending rank order.
    pub async fn collect_server_metrics(&mut self) -> Result<Vec<MetricsRecord>> {
        self.require(&[State::MeasuredComplete], "collect server metrics")?;

        let timeout = self.config.rpc_timeout;
        let mut records = Vec::with_capacity(self.servers.len());
        let mut result = Ok(());

        for (rank, handle) in &self.servers {
            let request = handle.request(Call::GetMetrics);
            match self.transport.call_sync(*rank, request, timeout).await {
                Ok(payload) => records.push(MetricsRecord::new(*rank, payload)),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        let result = result.map(|_| records);
        self.settle(result, State::MetricsCollected)
    }

    fn server_handle(&self, rank: Rank) -> Result<&RemoteHandle> {
        self.servers.get(&rank).ok_or_else(|| {
            OrchestratorError::InvalidState(format!("server {rank} is not bound"))
        })
    }

    /// Checks that the session is in one of the `allowed` states.
    fn require(&self, allowed: &[State], op: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }

        Err(OrchestratorError::InvalidState(format!(
            "cannot {op} while {}",
            self.state
        )))
    }

    /// Moves to `next` on success, to `Failed` otherwise.
    fn settle<V>(&mut self, result: Result<V>, next: State) -> Result<V> {
        match result {
            Ok(value) => {
                debug!("{} -> {next}", self.state);
                self.state = next;
                Ok(value)
            }
            Err(e) => {
                error!("run failed while {}: {e}", self.state);
                self.state = State::Failed;
                Err(e)
            }
        }
    }
}
