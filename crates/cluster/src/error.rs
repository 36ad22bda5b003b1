use std::fmt;

use thiserror::Error;

use crate::client::ClientError;

pub type Result<T> = std::result::Result<T, Error>;

/// The formation phase an error surfaced in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FormationPhase {
    /// Master setup: meet, slot assignment, node-id read.
    Master,
    /// Replica setup: meet and replicate.
    Replica,
}

impl fmt::Display for FormationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Replica => write!(f, "replica"),
        }
    }
}

/// Errors that can occur while building or running a cluster.
#[derive(Debug, Error)]
pub enum Error {
    /// The cluster has already been started.
    #[error("cluster already started")]
    AlreadyStarted,

    /// A formation command failed against the node at the given port.
    #[error("failed setting up {phase} instance at port {port}: {source}")]
    Formation {
        /// The phase the failing node belonged to.
        phase: FormationPhase,
        /// The port of the failing node.
        port: u16,
        /// The underlying protocol error.
        #[source]
        source: ClientError,
    },

    /// The requested topology is not a valid cluster layout.
    #[error("invalid cluster topology: {0}")]
    InvalidTopology(String),

    /// A node process failed to come up.
    #[error("failed starting node at port {port}: {source}")]
    NodeStart {
        /// The port of the failing node.
        port: u16,
        /// The underlying start error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An ephemeral port could not be allocated.
    #[error("could not allocate ports for the cluster: {0}")]
    PortAllocation(#[from] ember_util::port_allocator::Error),

    /// Repeated probing failed to produce enough distinct ports.
    #[error("could not find {needed} distinct ports after {attempts} attempts")]
    PortExhaustion {
        /// How many ports the topology needed.
        needed: usize,
        /// How many probe attempts were made.
        attempts: usize,
    },

    /// One or more nodes failed to stop during teardown.
    #[error("failed stopping {0} node(s)")]
    Shutdown(usize),
}
