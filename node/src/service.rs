use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow, bail};
use comms::{
    msg::{Call, Reply, Request},
    specs::{ServerSpec, TrainerJob},
};
use log::{debug, info, warn};
use orchestrator::{Rank, Transport, transport::Handler};
use parking_lot::Mutex;
use serde_json::{Value, json};
use strategies::{ParameterLink, Server, ServerStrategy, TrainerStrategy};

use crate::link::ServerLink;

/// Answers the master's and the trainers' calls on a trainer or server rank.
pub struct NodeService<T> {
    transport: Arc<T>,
    rank: Rank,
    timeout: Duration,
    server: Mutex<Option<Server>>,
}

impl<T: Transport + 'static> NodeService<T> {
    /// # Arguments
    /// * `transport` - This rank's transport, used by trainers to reach their server.
    /// * `timeout` - Timeout of the calls a trainer makes to its server.
    pub fn new(transport: Arc<T>, timeout: Duration) -> Self {
        let rank = transport.rank();
        Self {
            transport,
            rank,
            timeout,
            server: Mutex::new(None),
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Value> {
        match request.call {
            Call::CreateServer(spec) => self.create_server(spec).map(|_| Value::Null),
            Call::RunTrainer(job) => self.run_trainer(*job).await,
            Call::ResetState => self.with_server(|server| {
                server.reset_state();
                Ok(Value::Null)
            }),
            Call::GetMetrics => self.with_server(|server| Ok(server.metrics())),
            Call::InitParams { trainer, params } => {
                self.with_server(|server| Ok(json!(server.init_params(trainer, params)?)))
            }
            Call::PushGradient { trainer, gradient } => {
                self.with_server(|server| Ok(json!(server.push_gradient(trainer, &gradient)?)))
            }
            Call::Shutdown => bail!("shutdown is handled by the transport"),
        }
    }

    fn create_server(&self, spec: ServerSpec) -> Result<()> {
        if spec.rank != self.rank {
            bail!("rank {} cannot host server {}", self.rank, spec.rank);
        }

        let mut slot = self.server.lock();
        if slot.is_some() {
            bail!("rank {} already hosts a server", self.rank);
        }

        let server = strategies::server::from_spec(&spec)?;
        let kind = server.kind();
        info!(rank = self.rank; "created {kind} server for {} trainer(s)", spec.trainer_count);
        *slot = Some(server);
        Ok(())
    }

    async fn run_trainer(&self, job: TrainerJob) -> Result<Value> {
        let TrainerJob { spec, model, shard } = job;
        if spec.rank != self.rank {
            bail!("rank {} cannot run trainer {}", self.rank, spec.rank);
        }

        let mut trainer = strategies::trainer::from_spec(&spec.strategy)?;
        let link = spec.server.map(|server| {
            ServerLink::new(self.transport.clone(), server, spec.use_cuda_rpc, self.timeout)
        });

        info!(
            rank = self.rank;
            "training {} batch(es) for {} epoch(s)", shard.len(), spec.epochs
        );
        trainer
            .train(
                &model,
                &shard,
                spec.epochs,
                link.as_ref().map(|link| link as &dyn ParameterLink),
            )
            .await?;

        Ok(trainer.metrics())
    }

    fn with_server<F>(&self, f: F) -> Result<Value>
    where
        F: FnOnce(&mut Server) -> Result<Value>,
    {
        let mut slot = self.server.lock();
        let server = slot
            .as_mut()
            .ok_or_else(|| anyhow!("rank {} hosts no server", self.rank))?;
        f(server)
    }
}

#[async_trait::async_trait]
impl<T: Transport + 'static> Handler for NodeService<T> {
    async fn handle(&self, request: Request) -> Reply {
        let kind = request.call.kind();
        debug!(rank = self.rank; "handling {kind}");

        match self.dispatch(request).await {
            Ok(value) => Reply::Ok(value),
            Err(e) => {
                warn!(rank = self.rank; "{kind} failed: {e:#}");
                Reply::Err(format!("{e:#}"))
            }
        }
    }
}
