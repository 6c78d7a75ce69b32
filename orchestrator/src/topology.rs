//! Maps process ranks to roles and trainers to their owning parameter servers.
//!
//! Ranks are laid out in contiguous, half-open ranges:
//!
//! ```text
//! [trainers | cuda trainers | servers | cuda servers | master]
//! ```
//!
//! The master is always the last rank of the world.

use std::{fmt, ops::Range};

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// A process identity within a fixed-size world.
pub type Rank = usize;

/// The functional category of a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Trainer,
    CudaTrainer,
    Server,
    CudaServer,
    Master,
}

impl Role {
    pub fn is_trainer(self) -> bool {
        matches!(self, Role::Trainer | Role::CudaTrainer)
    }

    pub fn is_server(self) -> bool {
        matches!(self, Role::Server | Role::CudaServer)
    }

    /// Whether calls to and from this role carry the device-affinity hint.
    pub fn uses_device_affinity(self) -> bool {
        matches!(self, Role::CudaTrainer | Role::CudaServer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Trainer => "trainer",
            Role::CudaTrainer => "cuda trainer",
            Role::Server => "server",
            Role::CudaServer => "cuda server",
            Role::Master => "master",
        };
        f.write_str(name)
    }
}

/// The shape of a run: how many processes play each role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorldSpec {
    pub trainers: usize,
    pub cuda_trainers: usize,
    pub servers: usize,
    pub cuda_servers: usize,
}

impl WorldSpec {
    /// Creates a new validated `WorldSpec`.
    ///
    /// # Errors
    /// Returns `InvalidTopology` if the counts break the world invariants.
    pub fn new(
        trainers: usize,
        cuda_trainers: usize,
        servers: usize,
        cuda_servers: usize,
    ) -> Result<Self> {
        let world = Self {
            trainers,
            cuda_trainers,
            servers,
            cuda_servers,
        };
        world.validate()?;
        Ok(world)
    }

    /// Checks the world invariants.
    ///
    /// Every server kind must own an exact multiple of its trainers, and mixing cpu and
    /// cuda trainers requires servers of both kinds.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OrchestratorError::InvalidTopology(msg));

        let mixed = self.trainers > 0 && self.cuda_trainers > 0;
        if mixed && (self.servers == 0 || self.cuda_servers == 0) {
            return invalid(format!(
                "mixing {} cpu and {} cuda trainers requires servers of both kinds, got {} and {}",
                self.trainers, self.cuda_trainers, self.servers, self.cuda_servers
            ));
        }

        if self.servers > 0 {
            if self.trainers == 0 {
                return invalid(format!("{} servers configured without cpu trainers", self.servers));
            }
            if self.trainers % self.servers != 0 {
                return invalid(format!(
                    "{} trainers cannot be evenly split across {} servers",
                    self.trainers, self.servers
                ));
            }
        }

        if self.cuda_servers > 0 {
            if self.cuda_trainers == 0 {
                return invalid(format!(
                    "{} cuda servers configured without cuda trainers",
                    self.cuda_servers
                ));
            }
            if self.cuda_trainers % self.cuda_servers != 0 {
                return invalid(format!(
                    "{} cuda trainers cannot be evenly split across {} cuda servers",
                    self.cuda_trainers, self.cuda_servers
                ));
            }
        }

        Ok(())
    }

    /// The total amount of processes, master included.
    pub fn world_size(&self) -> usize {
        self.trainers + self.cuda_trainers + self.servers + self.cuda_servers + 1
    }

    /// The amount of trainers of both kinds.
    pub fn trainer_count(&self) -> usize {
        self.trainers + self.cuda_trainers
    }

    /// The amount of servers of both kinds.
    pub fn server_count(&self) -> usize {
        self.servers + self.cuda_servers
    }

    pub fn master(&self) -> Rank {
        self.world_size() - 1
    }

    /// The rank range occupied by `role`.
    pub fn range(&self, role: Role) -> Range<Rank> {
        let cuda_trainers = self.trainers;
        let servers = cuda_trainers + self.cuda_trainers;
        let cuda_servers = servers + self.servers;
        let master = cuda_servers + self.cuda_servers;

        match role {
            Role::Trainer => 0..cuda_trainers,
            Role::CudaTrainer => cuda_trainers..servers,
            Role::Server => servers..cuda_servers,
            Role::CudaServer => cuda_servers..master,
            Role::Master => master..master + 1,
        }
    }

    /// All trainer ranks, cpu first.
    pub fn trainer_ranks(&self) -> Range<Rank> {
        0..self.trainer_count()
    }

    /// All server ranks, cpu first.
    pub fn server_ranks(&self) -> Range<Rank> {
        let start = self.trainer_count();
        start..start + self.server_count()
    }

    /// How many trainers each server of `role`'s kind owns.
    ///
    /// Accepts either the trainer or the server role of a kind. Returns `None` for the
    /// master or for a kind without servers.
    pub fn trainers_per_server(&self, role: Role) -> Option<usize> {
        let (trainers, servers) = match role {
            Role::Trainer | Role::Server => (self.trainers, self.servers),
            Role::CudaTrainer | Role::CudaServer => (self.cuda_trainers, self.cuda_servers),
            Role::Master => return None,
        };

        (servers > 0).then(|| trainers / servers)
    }
}

/// Resolves the role played by `rank`.
///
/// Ranges are half-open and checked in order trainer, cuda trainer, server, cuda
/// server, master. A rank sitting on a boundary belongs to the next range.
///
/// # Errors
/// `InvalidTopology` if `world` is invalid, `InvalidRank` if `rank` is out of the world.
pub fn resolve_role(rank: Rank, world: &WorldSpec) -> Result<Role> {
    world.validate()?;

    let world_size = world.world_size();
    if rank >= world_size {
        return Err(OrchestratorError::InvalidRank { rank, world_size });
    }

    const ORDER: [Role; 5] = [
        Role::Trainer,
        Role::CudaTrainer,
        Role::Server,
        Role::CudaServer,
        Role::Master,
    ];

    ORDER
        .into_iter()
        .find(|role| world.range(*role).contains(&rank))
        .ok_or(OrchestratorError::InvalidRank { rank, world_size })
}

/// Resolves the server rank that owns trainer `rank`.
///
/// Returns `None` when the trainer's kind has no servers, a pure data-parallel setup.
///
/// # Errors
/// Same as `resolve_role`, plus `NotATrainer` for non-trainer ranks.
pub fn resolve_affinity(rank: Rank, world: &WorldSpec) -> Result<Option<Rank>> {
    let role = resolve_role(rank, world)?;
    if !role.is_trainer() {
        return Err(OrchestratorError::NotATrainer { rank, role });
    }

    let server_role = match role {
        Role::Trainer => Role::Server,
        _ => Role::CudaServer,
    };

    let Some(per_server) = world.trainers_per_server(role) else {
        return Ok(None);
    };

    let index = rank - world.range(role).start;
    Ok(Some(world.range(server_role).start + index / per_server))
}

/// The name a rank registers under with the transport.
pub fn process_name(rank: Rank, world: &WorldSpec) -> Result<String> {
    let name = match resolve_role(rank, world)? {
        Role::Trainer | Role::CudaTrainer => format!("trainer{rank}"),
        Role::Server | Role::CudaServer => format!("server{rank}"),
        Role::Master => "master".to_string(),
    };

    Ok(name)
}
