use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use comms::msg::{Call, Msg, Reply, Request};
use futures::{FutureExt, future};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use super::{PendingCall, Transport};
use crate::{
    error::{OrchestratorError, Result},
    topology::Rank,
};

const CONNECT_BACKOFF: Duration = Duration::from_millis(50);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The network address of every rank, indexed by rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    addrs: Vec<String>,
}

impl Endpoints {
    pub fn new(addrs: Vec<String>) -> Self {
        Self { addrs }
    }

    /// Rank `r` listens at `host:(base_port + r)`.
    ///
    /// # Errors
    /// `InvalidConfig` if the last rank's port does not fit in a `u16`.
    pub fn contiguous(host: &str, base_port: u16, world_size: usize) -> Result<Self> {
        let addrs = (0..world_size)
            .map(|rank| {
                u16::try_from(rank)
                    .ok()
                    .and_then(|offset| base_port.checked_add(offset))
                    .map(|port| format!("{host}:{port}"))
                    .ok_or_else(|| {
                        OrchestratorError::InvalidConfig(format!(
                            "port {base_port} + {rank} is out of range"
                        ))
                    })
            })
            .collect::<Result<_>>()?;

        Ok(Self { addrs })
    }

    pub fn get(&self, rank: Rank) -> Option<&str> {
        self.addrs.get(rank).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Serves the inbound calls of a rank.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handles every call except `Shutdown`, which the agent answers itself.
    async fn handle(&self, request: Request) -> Reply;
}

/// TCP implementation of `Transport`.
///
/// Each rank listens on its own endpoint. Calls open one connection each, write a
/// single request frame and read a single reply frame.
pub struct RpcAgent {
    rank: Rank,
    endpoints: Arc<Endpoints>,
    listener: Mutex<Option<TcpListener>>,
    stop: CancellationToken,
}

impl RpcAgent {
    /// Registers `rank` by binding its endpoint.
    ///
    /// # Arguments
    /// * `rank` - This process's rank.
    /// * `endpoints` - The address of every rank in the world.
    ///
    /// # Errors
    /// `InvalidRank` if `rank` has no endpoint, `Io` if binding fails.
    pub async fn init(rank: Rank, endpoints: Endpoints) -> Result<Self> {
        let addr = endpoints
            .get(rank)
            .ok_or(OrchestratorError::InvalidRank {
                rank,
                world_size: endpoints.len(),
            })?;

        let listener = TcpListener::bind(addr).await?;
        info!(rank = rank; "listening at {addr}");
        Ok(Self::with_listener(rank, endpoints, listener))
    }

    /// Creates an agent over an already bound listener.
    pub fn with_listener(rank: Rank, endpoints: Endpoints, listener: TcpListener) -> Self {
        Self {
            rank,
            endpoints: Arc::new(endpoints),
            listener: Mutex::new(Some(listener)),
            stop: CancellationToken::new(),
        }
    }

    /// The address this agent is listening at, until it starts serving.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &*self.listener.lock() {
            Some(listener) => listener.local_addr(),
            None => Err(io::Error::other("listener already taken by the serving loop")),
        }
    }

    /// Accepts and handles inbound calls until a `Shutdown` call arrives or `shutdown`
    /// is invoked locally.
    ///
    /// # Errors
    /// `InvalidState` if called twice, `Io` if accepting fails.
    pub async fn serve<H: Handler>(&self, handler: Arc<H>) -> Result<()> {
        let listener = self.listener.lock().take().ok_or_else(|| {
            OrchestratorError::InvalidState(format!("rank {} is already serving", self.rank))
        })?;

        let mut connections = JoinSet::new();
        let rank = self.rank;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(rank = rank; "connection from {peer}");

                    let handler = handler.clone();
                    let stop = self.stop.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, handler, stop).await {
                            warn!(rank = rank; "failed to serve {peer}: {e}");
                        }
                    });
                }
                // Reap finished connections so the set does not grow unbounded.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(rank = rank; "serving loop stopped");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for RpcAgent {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn call_async(&self, to: Rank, request: Request, timeout: Duration) -> PendingCall {
        let addr = self.endpoints.get(to).map(str::to_string);
        let world_size = self.endpoints.len();

        let reply = async move {
            let addr = addr.ok_or(OrchestratorError::InvalidRank {
                rank: to,
                world_size,
            })?;
            exchange(to, addr, request, timeout).await
        };

        PendingCall::new(to, reply.boxed())
    }

    /// Stops the local serving loop. On the master, the last rank, every other rank is
    /// released first.
    async fn shutdown(&self) -> Result<()> {
        let master = self.endpoints.len().saturating_sub(1);

        if self.rank == master {
            let releases = (0..master).map(|rank| {
                let request = Request {
                    call: Call::Shutdown,
                    device_affinity: false,
                };
                self.call_sync(rank, request, SHUTDOWN_TIMEOUT)
                    .map(move |res| (rank, res))
            });

            for (rank, res) in future::join_all(releases).await {
                if let Err(e) = res {
                    warn!(rank = rank; "failed to release rank: {e}");
                }
            }
        }

        self.stop.cancel();
        Ok(())
    }
}

/// Performs one request/reply exchange with `to`, bounded by `timeout`.
async fn exchange(to: Rank, addr: String, request: Request, timeout: Duration) -> Result<Value> {
    let deadline = Instant::now() + timeout;
    let kind = request.call.kind();

    let round_trip = async {
        let stream = connect(&addr).await?;
        let (rx, tx) = stream.into_split();
        let (mut rx, mut tx) = comms::channel(rx, tx);

        tx.send(&Msg::Request(request)).await?;

        match rx.recv::<Msg>().await? {
            Msg::Reply(reply) => Ok::<_, io::Error>(reply),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected a reply, got {}", other.kind()),
            )),
        }
    };

    let reply = match time::timeout_at(deadline, round_trip).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(source)) => {
            return Err(OrchestratorError::ConnectionFailed {
                rank: to,
                addr,
                source,
            });
        }
        Err(_) => {
            return Err(OrchestratorError::RpcTimeout {
                ranks: vec![to],
                timeout,
            });
        }
    };

    debug!(rank = to; "{kind} answered");
    reply
        .into_result()
        .map_err(|msg| OrchestratorError::Remote { rank: to, msg })
}

/// Connects to `addr`, retrying while the peer is not listening yet.
async fn connect(addr: &str) -> io::Result<TcpStream> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reads one request from `stream`, answers it and closes the connection.
async fn handle_connection<H: Handler>(
    stream: TcpStream,
    handler: Arc<H>,
    stop: CancellationToken,
) -> io::Result<()> {
    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = comms::channel(rx, tx);

    let request = match rx.recv::<Msg>().await? {
        Msg::Request(request) => request,
        other => {
            let reply = Reply::Err(format!("expected a request, got {}", other.kind()));
            return tx.send(&Msg::Reply(reply)).await;
        }
    };

    if let Call::Shutdown = request.call {
        tx.send(&Msg::Reply(Reply::done())).await?;
        stop.cancel();
        return Ok(());
    }

    let reply = handler.handle(request).await;
    tx.send(&Msg::Reply(reply)).await
}
