mod tcp;

use std::time::Duration;

use comms::{
    msg::{Call, Request},
    specs::ServerSpec,
};
use futures::future::BoxFuture;
use serde_json::Value;

pub use tcp::{Endpoints, Handler, RpcAgent};

use crate::{
    error::{OrchestratorError, Result},
    topology::Rank,
};

/// A reference to a bound remote server, owned by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHandle {
    rank: Rank,
    name: String,
    device_affinity: bool,
}

impl RemoteHandle {
    pub fn new(rank: Rank, name: impl Into<String>, device_affinity: bool) -> Self {
        Self {
            rank,
            name: name.into(),
            device_affinity,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_affinity(&self) -> bool {
        self.device_affinity
    }

    /// Wraps `call` into a request carrying this handle's affinity hint.
    pub fn request(&self, call: Call) -> Request {
        Request {
            call,
            device_affinity: self.device_affinity,
        }
    }
}

/// An issued call whose reply has not been awaited yet.
pub struct PendingCall {
    rank: Rank,
    reply: BoxFuture<'static, Result<Value>>,
}

impl PendingCall {
    pub fn new(rank: Rank, reply: BoxFuture<'static, Result<Value>>) -> Self {
        Self { rank, reply }
    }

    /// The callee's rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn into_parts(self) -> (Rank, BoxFuture<'static, Result<Value>>) {
        (self.rank, self.reply)
    }
}

/// The remote-call capability the orchestration core consumes.
///
/// Implementations are constructed already registered (`init`), every call carries its
/// own timeout and the device-affinity hint of its request.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// This process's own rank.
    fn rank(&self) -> Rank;

    /// Issues `request` to `to` without waiting for the reply.
    ///
    /// # Arguments
    /// * `to` - The callee's rank.
    /// * `request` - The call and its affinity hint.
    /// * `timeout` - Upper bound for the whole exchange.
    ///
    /// # Returns
    /// A pending call resolving to the callee's reply.
    fn call_async(&self, to: Rank, request: Request, timeout: Duration) -> PendingCall;

    /// Releases this process's transport resources.
    async fn shutdown(&self) -> Result<()>;

    /// Issues `request` to `to` and waits for the reply.
    async fn call_sync(&self, to: Rank, request: Request, timeout: Duration) -> Result<Value> {
        let (_, reply) = self.call_async(to, request, timeout).into_parts();
        reply.await
    }

    /// Constructs a server on `spec.rank` and returns a handle to it.
    ///
    /// # Errors
    /// Any failure is reported as `RemoteBind` for that rank.
    async fn remote_bind(&self, spec: ServerSpec, timeout: Duration) -> Result<RemoteHandle> {
        let rank = spec.rank;
        let device_affinity = spec.use_cuda_rpc;
        let request = Request {
            call: Call::CreateServer(spec),
            device_affinity,
        };

        match self.call_sync(rank, request, timeout).await {
            Ok(_) => Ok(RemoteHandle::new(rank, format!("server{rank}"), device_affinity)),
            Err(e) => Err(OrchestratorError::RemoteBind {
                rank,
                msg: e.to_string(),
            }),
        }
    }
}
