//! Ephemeral multi-node Redis clusters for integration testing.
//!
//! Spawns a set of independent `redis-server` processes and drives the
//! cluster-formation handshake that turns them into one logical sharded
//! cluster: every node is introduced to the first master, the 16384 hash
//! slots are striped over the masters, and replicas are attached to their
//! masters in contiguous blocks. Formation is all-or-nothing: any failure
//! tears every started node back down.
//!
//! ```no_run
//! use ember_cluster::RedisCluster;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = RedisCluster::builder()
//!     .with_masters(3)
//!     .with_replicas_per_master(1)
//!     .build()?;
//!
//! cluster.start().await?;
//! assert!(cluster.is_active().await);
//! cluster.stop().await?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod cluster;
mod error;
mod topology;

pub use client::{
    ClientError, ProtocolClient, ProtocolConnector, RedisConnector, RedisProtocolClient,
};
pub use cluster::{ClusterBuilder, ClusterState, FormationTimings, RedisCluster};
pub use error::{Error, FormationPhase};
pub use topology::{ClusterTopology, HASH_SLOTS};
