use std::{fmt, io, time::Duration};

use crate::topology::{Rank, Role};

/// The orchestrator module's result type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// All errors that can occur while resolving the topology and driving a run.
#[derive(Debug)]
pub enum OrchestratorError {
    /// The world description violates its invariants, caught before any process starts.
    InvalidTopology(String),
    /// A rank outside of `[0, world_size)`.
    InvalidRank { rank: Rank, world_size: usize },
    /// Affinity was requested for a rank that is not a trainer.
    NotATrainer { rank: Rank, role: Role },
    /// Invalid run configuration, caught before connecting.
    InvalidConfig(String),
    /// An operation was issued in the wrong orchestration state.
    InvalidState(String),
    /// A server could not be constructed during setup.
    RemoteBind { rank: Rank, msg: String },
    /// Failed to reach a remote rank.
    ConnectionFailed {
        rank: Rank,
        addr: String,
        source: io::Error,
    },
    /// The given ranks did not answer within the timeout.
    RpcTimeout { ranks: Vec<Rank>, timeout: Duration },
    /// A remote rank answered with an error.
    Remote { rank: Rank, msg: String },
    /// An underlying I/O error not covered by the above variants.
    Io(io::Error),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopology(msg) => write!(f, "invalid topology: {msg}"),
            Self::InvalidRank { rank, world_size } => {
                write!(f, "rank {rank} is outside of a world of size {world_size}")
            }
            Self::NotATrainer { rank, role } => {
                write!(f, "rank {rank} is a {role}, affinity is only defined for trainers")
            }
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::RemoteBind { rank, msg } => write!(f, "failed to bind server {rank}: {msg}"),
            Self::ConnectionFailed { rank, addr, source } => {
                write!(f, "connection failed to rank {rank} at {addr}: {source}")
            }
            Self::RpcTimeout { ranks, timeout } => {
                write!(f, "ranks {ranks:?} did not respond within {timeout:?}")
            }
            Self::Remote { rank, msg } => write!(f, "rank {rank} error: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConnectionFailed { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OrchestratorError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
