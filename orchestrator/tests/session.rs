use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use comms::{
    msg::{Call, Request},
    specs::{Batch, ModelState, Sample, StrategySpec, TrainerJob},
};
use futures::{FutureExt, future};
use orchestrator::{
    BenchmarkConfig, OrchestratorError, Phase, Rank, Result, Session, State, Transport,
    WorldSpec,
    session::{PendingCalls, await_all},
    transport::PendingCall,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::{self, Instant};

/// Records every call and answers them in reverse rank order.
#[derive(Default)]
struct MockTransport {
    master: Rank,
    calls: Mutex<Vec<(Rank, &'static str)>>,
    jobs: Mutex<Vec<TrainerJob>>,
    runs: Mutex<HashMap<Rank, usize>>,
    /// `(rank, n)`: the n-th training call to `rank` never answers.
    stall: Option<(Rank, usize)>,
    /// This rank fails every call.
    broken: Option<Rank>,
}

impl MockTransport {
    fn new(world: &WorldSpec) -> Self {
        Self {
            master: world.master(),
            ..Self::default()
        }
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|(_, kind)| *kind).collect()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn rank(&self) -> Rank {
        self.master
    }

    fn call_async(&self, to: Rank, request: Request, _timeout: Duration) -> PendingCall {
        self.calls.lock().push((to, request.call.kind()));

        if self.broken == Some(to) {
            let e = OrchestratorError::Remote {
                rank: to,
                msg: "unreachable".into(),
            };
            return PendingCall::new(to, future::ready(Err(e)).boxed());
        }

        let reply = match request.call {
            Call::RunTrainer(job) => {
                let run = {
                    let mut runs = self.runs.lock();
                    let run = runs.entry(to).or_default();
                    *run += 1;
                    *run
                };

                let batches = job.shard.len();
                self.jobs.lock().push(*job);

                if self.stall == Some((to, run)) {
                    future::pending().boxed()
                } else {
                    // Later ranks finish first.
                    let delay = Duration::from_millis(10 * (8 - to as u64));
                    async move {
                        time::sleep(delay).await;
                        Ok(json!({ "rank": to, "batches": batches }))
                    }
                    .boxed()
                }
            }
            Call::GetMetrics => future::ready(Ok(json!({ "server": to }))).boxed(),
            _ => future::ready(Ok(Value::Null)).boxed(),
        };

        PendingCall::new(to, reply)
    }

    async fn shutdown(&self) -> Result<()> {
        self.calls.lock().push((self.master, "shutdown"));
        Ok(())
    }
}

fn config(world: WorldSpec) -> BenchmarkConfig {
    BenchmarkConfig {
        world,
        trainer: StrategySpec::with_params("sgd", json!({ "lr": 0.1 })),
        server: StrategySpec::new("sgd"),
        backend: "gloo".into(),
        filestore: None,
        epochs: NonZeroUsize::new(2).unwrap(),
        batch_size: NonZeroUsize::new(1).unwrap(),
        rpc_timeout: Duration::from_millis(500),
        seed: 0,
    }
}

fn model() -> ModelState {
    ModelState {
        kind: "linear".into(),
        inputs: 1,
        params: vec![0.5, -0.5],
    }
}

fn batches(n: usize) -> Vec<Batch> {
    (0..n)
        .map(|i| {
            Batch::new(vec![Sample {
                features: vec![i as f32],
                target: i as f32,
            }])
        })
        .collect()
}

#[tokio::test]
async fn run_reports_every_trainer_and_server() {
    let world = WorldSpec::new(4, 0, 2, 0).unwrap();
    let transport = Arc::new(MockTransport::new(&world));
    let mut session = Session::new(transport.clone(), config(world)).unwrap();

    let report = session.run(&model(), batches(10)).await.unwrap();

    assert_eq!(session.state(), State::Done);
    assert_eq!(report.trainers.ranks(), [0, 1, 2, 3]);
    assert_eq!(report.servers.ranks(), [4, 5]);
    assert_eq!(report.trainers.get(0), Some(&json!({ "rank": 0, "batches": 3 })));
    assert_eq!(report.trainers.get(3), Some(&json!({ "rank": 3, "batches": 2 })));
    assert_eq!(report.servers.get(5), Some(&json!({ "server": 5 })));

    let mut kinds = vec!["create_server"; 2];
    kinds.extend(["run_trainer"; 4]);
    kinds.extend(["reset_state"; 2]);
    kinds.extend(["run_trainer"; 4]);
    kinds.extend(["get_metrics"; 2]);
    assert_eq!(transport.kinds(), kinds);

    let jobs = transport.jobs.lock();
    assert_eq!(jobs.len(), 8);
    for job in jobs.iter() {
        let expected_server = if job.spec.rank < 2 { 4 } else { 5 };
        assert_eq!(job.spec.server, Some(expected_server));
        assert_eq!(job.spec.trainer_count, 4);
        assert_eq!(job.spec.process_group.size, 4);
        assert!(!job.spec.use_cuda_rpc);
        assert_eq!(job.model, model());
    }

    let first_shard: Vec<f32> = jobs[0]
        .shard
        .iter()
        .map(|batch| batch.samples[0].target)
        .collect();
    assert_eq!(first_shard, [0.0, 4.0, 8.0]);
}

#[tokio::test]
async fn trainer_stalling_in_measured_pass_fails_the_run() {
    let world = WorldSpec::new(4, 0, 2, 0).unwrap();
    let transport = Arc::new(MockTransport {
        stall: Some((2, 2)),
        ..MockTransport::new(&world)
    });
    let config = config(world);
    let timeout = config.rpc_timeout;
    let mut session = Session::new(transport.clone(), config).unwrap();

    let start = Instant::now();
    let err = session.run(&model(), batches(10)).await.unwrap_err();

    match err {
        OrchestratorError::RpcTimeout { ranks, .. } => assert_eq!(ranks, [2]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.state(), State::Failed);
    assert!(start.elapsed() < timeout * 4);
    assert!(!transport.kinds().contains(&"get_metrics"));
}

#[tokio::test]
async fn failed_bind_aborts_before_warmup() {
    let world = WorldSpec::new(4, 0, 2, 0).unwrap();
    let transport = Arc::new(MockTransport {
        broken: Some(5),
        ..MockTransport::new(&world)
    });
    let mut session = Session::new(transport.clone(), config(world)).unwrap();

    let err = session.run(&model(), batches(4)).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::RemoteBind { rank: 5, .. }));
    assert_eq!(session.state(), State::Failed);
    assert!(!transport.kinds().contains(&"run_trainer"));
}

#[tokio::test]
async fn failing_trainer_fails_the_run() {
    let world = WorldSpec::new(2, 0, 0, 0).unwrap();
    let transport = Arc::new(MockTransport {
        broken: Some(1),
        ..MockTransport::new(&world)
    });
    let mut session = Session::new(transport, config(world)).unwrap();

    let err = session.run(&model(), batches(4)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Remote { rank: 1, .. }));
    assert_eq!(session.state(), State::Failed);
}

#[tokio::test]
async fn trainers_run_without_servers() {
    let world = WorldSpec::new(3, 0, 0, 0).unwrap();
    let transport = Arc::new(MockTransport::new(&world));
    let mut session = Session::new(transport.clone(), config(world)).unwrap();

    let report = session.run(&model(), batches(5)).await.unwrap();

    assert_eq!(report.trainers.len(), 3);
    assert!(report.servers.is_empty());
    assert!(session.servers().is_empty());
    assert!(!transport.kinds().contains(&"reset_state"));
    assert!(transport.jobs.lock().iter().all(|job| job.spec.server.is_none()));
}

#[tokio::test]
async fn cuda_trainers_carry_the_affinity_hint() {
    let world = WorldSpec::new(2, 2, 1, 1).unwrap();
    let transport = Arc::new(MockTransport::new(&world));
    let mut session = Session::new(transport.clone(), config(world)).unwrap();

    session.run(&model(), batches(8)).await.unwrap();

    let handles = session.servers();
    assert!(!handles[&4].device_affinity());
    assert!(handles[&5].device_affinity());

    for job in transport.jobs.lock().iter() {
        let cuda = job.spec.rank >= 2;
        assert_eq!(job.spec.use_cuda_rpc, cuda);
        assert_eq!(job.spec.server, Some(if cuda { 5 } else { 4 }));
    }
}

#[tokio::test]
async fn operations_out_of_order_are_rejected() {
    let world = WorldSpec::new(2, 0, 1, 0).unwrap();
    let transport = Arc::new(MockTransport::new(&world));
    let mut session = Session::new(transport.clone(), config(world)).unwrap();

    let shards = vec![Vec::new(), Vec::new()];
    let err = session
        .dispatch_trainers(Phase::Warmup, &model(), &shards)
        .err()
        .unwrap();

    assert!(matches!(err, OrchestratorError::InvalidState(_)));
    assert_eq!(session.state(), State::Init);
    assert!(transport.kinds().is_empty());
}

#[tokio::test]
async fn benchmark_shuts_down_after_failure() {
    let world = WorldSpec::new(2, 0, 1, 0).unwrap();
    let transport = Arc::new(MockTransport {
        broken: Some(2),
        ..MockTransport::new(&world)
    });

    let res = orchestrator::benchmark(transport.clone(), config(world), &model(), batches(2)).await;

    assert!(res.is_err());
    assert_eq!(transport.kinds().last(), Some(&"shutdown"));
}

#[tokio::test]
async fn await_all_returns_one_result_per_rank() {
    let mut pending = PendingCalls::new(Phase::Measured);
    for rank in [3, 0, 2, 1] {
        let delay = Duration::from_millis(5 * rank as u64);
        let reply = async move {
            time::sleep(delay).await;
            Ok(json!(rank))
        };
        pending.push(PendingCall::new(rank, reply.boxed()));
    }

    let results = await_all(pending, Duration::from_secs(5)).await.unwrap();
    let ranks: Vec<_> = results.iter().map(|(rank, _)| *rank).collect();
    assert_eq!(ranks, [0, 1, 2, 3]);
    assert!(results.iter().all(|(rank, value)| value == &json!(rank)));
}

#[tokio::test(start_paused = true)]
async fn await_all_gives_up_at_the_timeout() {
    const TIMEOUT: Duration = Duration::from_secs(30);

    let mut pending = PendingCalls::new(Phase::Warmup);
    pending.push(PendingCall::new(0, future::ready(Ok(Value::Null)).boxed()));
    pending.push(PendingCall::new(1, future::pending().boxed()));
    pending.push(PendingCall::new(2, future::pending().boxed()));

    let start = Instant::now();
    let err = await_all(pending, TIMEOUT).await.unwrap_err();

    assert!(start.elapsed() <= TIMEOUT + Duration::from_millis(1));
    match err {
        OrchestratorError::RpcTimeout { ranks, timeout } => {
            assert_eq!(ranks, [1, 2]);
            assert_eq!(timeout, TIMEOUT);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn await_all_names_ranks_whose_own_timer_fired_first() {
    const TIMEOUT: Duration = Duration::from_secs(30);

    let mut pending = PendingCalls::new(Phase::Measured);
    let expired = OrchestratorError::RpcTimeout {
        ranks: vec![0],
        timeout: TIMEOUT,
    };
    pending.push(PendingCall::new(0, future::ready(Err(expired)).boxed()));
    pending.push(PendingCall::new(1, future::pending().boxed()));
    pending.push(PendingCall::new(2, future::pending().boxed()));
    pending.push(PendingCall::new(3, future::ready(Ok(Value::Null)).boxed()));

    let err = await_all(pending, TIMEOUT).await.unwrap_err();

    match err {
        OrchestratorError::RpcTimeout { ranks, .. } => assert_eq!(ranks, [0, 1, 2]),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn master_only_world_reports_nothing() {
    let world = WorldSpec::new(0, 0, 0, 0).unwrap();
    let transport = Arc::new(MockTransport::new(&world));
    let mut session = Session::new(transport.clone(), config(world)).unwrap();

    let report = session.run(&model(), batches(4)).await.unwrap();

    assert_eq!(session.state(), State::Done);
    assert!(report.trainers.is_empty());
    assert!(report.servers.is_empty());
    assert!(transport.kinds().is_empty());
}
