//! Cluster formation orchestration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ember_bootable::Bootable;
use ember_server::{RedisServer, RedisServerOptions};
use ember_util::port_allocator::allocate_port;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ProtocolClient, ProtocolConnector, RedisConnector};
use crate::error::{Error, FormationPhase};
use crate::topology::ClusterTopology;

/// Address nodes reach each other on.
const LOCALHOST: &str = "127.0.0.1";

/// Observable lifecycle state of a cluster.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClusterState {
    /// Built but never started.
    Created,
    /// Node processes are coming up.
    Starting,
    /// Every hash slot has been claimed by a master.
    SlotsAssigned,
    /// Replicas are attached to their masters.
    ReplicasAttached,
    /// Formation finished; the cluster is serving.
    Running,
    /// Formation failed; teardown is in progress.
    Failed(String),
    /// All nodes have been stopped.
    Stopped,
}

/// Wall-clock pauses standing in for gossip-convergence polling.
///
/// Cluster gossip is asynchronous; a node will refuse a replicate command
/// until it has learned of the named master. The defaults are deliberately
/// generous fixed delays so formation stays deterministic for tests.
#[derive(Clone, Copy, Debug)]
pub struct FormationTimings {
    /// Pause after master setup, multiplied by the master count.
    pub gossip_per_master: Duration,

    /// Pause between a replica's meet and its replicate command.
    pub replica_meet: Duration,

    /// Final pause before the cluster is declared running.
    pub settle: Duration,
}

impl Default for FormationTimings {
    fn default() -> Self {
        Self {
            gossip_per_master: Duration::from_millis(300),
            replica_meet: Duration::from_secs(1),
            settle: Duration::from_millis(500),
        }
    }
}

/// An ephemeral Redis cluster formed from locally spawned nodes.
///
/// Owns one node handle per port in the topology (masters first, then
/// replicas) and sequences the bootstrap protocol across them: meet every
/// node at the first master, stripe the 16384 hash slots over the masters,
/// then attach replicas to their masters by node id. Any failure during
/// formation tears the whole cluster down; callers never observe a
/// half-formed cluster.
pub struct RedisCluster<C = RedisConnector>
where
    C: ProtocolConnector,
{
    servers: Vec<Arc<dyn Bootable>>,
    topology: ClusterTopology,
    connector: C,
    timings: FormationTimings,
    state: Arc<RwLock<ClusterState>>,
}

impl RedisCluster<RedisConnector> {
    /// Create a new cluster builder.
    #[must_use]
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::default()
    }
}

impl<C> RedisCluster<C>
where
    C: ProtocolConnector,
{
    /// Create a cluster from pre-built node handles.
    ///
    /// `servers` must align with `topology.all_ports()`: one handle per
    /// port, masters first, then replicas.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTopology` if the handle count does not match
    /// the topology.
    pub fn new(
        servers: Vec<Arc<dyn Bootable>>,
        topology: ClusterTopology,
        connector: C,
        timings: FormationTimings,
    ) -> Result<Self, Error> {
        if servers.len() != topology.node_count() {
            return Err(Error::InvalidTopology(format!(
                "{} node handles supplied for {} ports",
                servers.len(),
                topology.node_count()
            )));
        }

        Ok(Self {
            servers,
            topology,
            connector,
            timings,
            state: Arc::new(RwLock::new(ClusterState::Created)),
        })
    }

    /// Start every node and drive the cluster-formation handshake.
    ///
    /// On success the cluster is `Running`. On any failure every started
    /// node is torn down, the observable state is `Stopped`, and the error
    /// names the failing port and phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster is already started, a node fails to
    /// come up, or any formation command fails.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.state.write();
            if !matches!(
                *state,
                ClusterState::Created | ClusterState::Stopped | ClusterState::Failed(_)
            ) {
                return Err(Error::AlreadyStarted);
            }
            *state = ClusterState::Starting;
        }

        if let Err(error) = self.form().await {
            warn!("cluster formation failed, tearing down: {}", error);
            *self.state.write() = ClusterState::Failed(error.to_string());

            // Best-effort teardown; the formation error stays the reported one.
            self.stop_all().await;
            *self.state.write() = ClusterState::Stopped;

            return Err(error);
        }

        *self.state.write() = ClusterState::Running;
        info!("cluster running on ports {:?}", self.topology.all_ports());

        Ok(())
    }

    /// Stop every node.
    ///
    /// Best-effort: every node gets a stop attempt even when an earlier one
    /// fails. Stopping an already-stopped cluster is not an error.
    ///
    /// # Errors
    ///
    /// Returns an aggregate error naming how many nodes failed to stop.
    pub async fn stop(&self) -> Result<(), Error> {
        let failures = self.stop_all().await;
        *self.state.write() = ClusterState::Stopped;

        if failures == 0 {
            Ok(())
        } else {
            Err(Error::Shutdown(failures))
        }
    }

    /// Whether every node in the cluster is live.
    pub async fn is_active(&self) -> bool {
        for server in &self.servers {
            if !server.is_active().await {
                return false;
            }
        }
        true
    }

    /// Every port in the cluster: masters first, then replicas.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        self.server_ports()
    }

    /// Every port in the cluster: masters first, then replicas.
    #[must_use]
    pub fn server_ports(&self) -> Vec<u16> {
        self.topology.all_ports()
    }

    /// Read-only view of the owned node handles.
    #[must_use]
    pub fn servers(&self) -> &[Arc<dyn Bootable>] {
        &self.servers
    }

    /// The cluster topology.
    #[must_use]
    pub const fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClusterState {
        self.state.read().clone()
    }

    async fn form(&self) -> Result<(), Error> {
        self.start_nodes().await?;

        let master_ids = self.setup_masters().await?;
        *self.state.write() = ClusterState::SlotsAssigned;

        // Gossip needs wall-clock time to converge before replication is
        // accepted.
        let masters = u32::try_from(self.topology.master_count()).unwrap_or(u32::MAX);
        tokio::time::sleep(self.timings.gossip_per_master * masters).await;

        self.setup_replicas(&master_ids).await?;
        *self.state.write() = ClusterState::ReplicasAttached;

        tokio::time::sleep(self.timings.settle).await;

        Ok(())
    }

    /// Start every node handle. Formation must not begin until every node
    /// reports itself listening.
    async fn start_nodes(&self) -> Result<(), Error> {
        for (server, port) in self.servers.iter().zip(self.topology.all_ports()) {
            server
                .start()
                .await
                .map_err(|source| Error::NodeStart { port, source })?;
        }
        Ok(())
    }

    /// Merge every master into the cluster and stripe the hash slots over
    /// them. Returns the cluster-assigned node ids, indexed by master
    /// position.
    async fn setup_masters(&self) -> Result<Vec<String>, Error> {
        let meet_target = self.topology.meet_target();
        let mut master_ids = Vec::with_capacity(self.topology.master_count());

        for (index, &port) in self.topology.master_ports().iter().enumerate() {
            let slots = self.topology.slots_for_master(index);

            let result: Result<String, ClientError> = async {
                let mut client = self.connector.connect(port).await?;

                // The meet target is already a member of its own cluster.
                if port != meet_target {
                    client.meet(LOCALHOST, meet_target).await?;
                }

                client.add_slots(&slots).await?;
                client.node_id().await
                // Client dropped here: the connection is closed before the
                // next master is touched, on success and error alike.
            }
            .await;

            match result {
                Ok(node_id) => {
                    debug!(
                        "master at port {} ({}) owns {} slots",
                        port,
                        node_id,
                        slots.len()
                    );
                    master_ids.push(node_id);
                }
                Err(source) => {
                    return Err(Error::Formation {
                        phase: FormationPhase::Master,
                        port,
                        source,
                    });
                }
            }
        }

        Ok(master_ids)
    }

    /// Merge every replica into the cluster and attach it to its master.
    /// Replicas are assigned in contiguous blocks of `replicas_per_shard`,
    /// in master order.
    async fn setup_replicas(&self, master_ids: &[String]) -> Result<(), Error> {
        let meet_target = self.topology.meet_target();

        for (index, &port) in self.topology.replica_ports().iter().enumerate() {
            // The mapping is defined for every index the loop visits.
            let Some(master_index) = self.topology.master_for_replica(index) else {
                continue;
            };
            let master_id = &master_ids[master_index];

            let result: Result<(), ClientError> = async {
                let mut client = self.connector.connect(port).await?;
                client.meet(LOCALHOST, meet_target).await?;

                // The replica must learn of its master through gossip before
                // it will accept the replicate command.
                tokio::time::sleep(self.timings.replica_meet).await;

                client.replicate(master_id).await
            }
            .await;

            if let Err(source) = result {
                return Err(Error::Formation {
                    phase: FormationPhase::Replica,
                    port,
                    source,
                });
            }

            debug!("replica at port {} attached to master {}", port, master_id);
        }

        Ok(())
    }

    /// Stop every node, attempting all of them regardless of individual
    /// failures. Returns the number of failed stops.
    async fn stop_all(&self) -> usize {
        let mut failures = 0;

        for (server, port) in self.servers.iter().zip(self.topology.all_ports()) {
            if let Err(error) = server.shutdown().await {
                warn!("failed to stop node at port {}: {}", port, error);
                failures += 1;
            }
        }

        failures
    }
}

#[async_trait]
impl<C> Bootable for RedisCluster<C>
where
    C: ProtocolConnector,
{
    fn name(&self) -> &str {
        "redis-cluster"
    }

    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Self::start(self).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.stop().await?;
        Ok(())
    }

    async fn is_active(&self) -> bool {
        Self::is_active(self).await
    }

    async fn wait(&self) {
        for server in &self.servers {
            server.wait().await;
        }
    }
}

/// Builder for creating a `RedisCluster` backed by real `redis-server`
/// processes.
pub struct ClusterBuilder {
    masters: usize,
    replicas_per_master: usize,
    master_ports: Option<Vec<u16>>,
    replica_ports: Option<Vec<u16>>,
    executable: Option<PathBuf>,
    timings: FormationTimings,
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self {
            masters: 3,
            replicas_per_master: 0,
            master_ports: None,
            replica_ports: None,
            executable: None,
            timings: FormationTimings::default(),
        }
    }
}

impl ClusterBuilder {
    /// Set the number of masters. Ignored when explicit master ports are
    /// supplied.
    #[must_use]
    pub const fn with_masters(mut self, masters: usize) -> Self {
        self.masters = masters;
        self
    }

    /// Set the number of replicas attached to each master. Ignored when
    /// explicit replica ports are supplied.
    #[must_use]
    pub const fn with_replicas_per_master(mut self, replicas: usize) -> Self {
        self.replicas_per_master = replicas;
        self
    }

    /// Use these exact master ports instead of allocating ephemeral ones.
    #[must_use]
    pub fn with_master_ports(mut self, ports: Vec<u16>) -> Self {
        self.master_ports = Some(ports);
        self
    }

    /// Use these exact replica ports instead of allocating ephemeral ones.
    #[must_use]
    pub fn with_replica_ports(mut self, ports: Vec<u16>) -> Self {
        self.replica_ports = Some(ports);
        self
    }

    /// Path to the redis-server binary if it is not in the PATH.
    #[must_use]
    pub fn with_executable(mut self, executable: PathBuf) -> Self {
        self.executable = Some(executable);
        self
    }

    /// Override the formation pauses (useful for tests).
    #[must_use]
    pub const fn with_timings(mut self, timings: FormationTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Build the cluster. Nodes are not started until
    /// [`RedisCluster::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if port allocation fails or the resulting topology
    /// is invalid.
    pub fn build(self) -> Result<RedisCluster<RedisConnector>, Error> {
        let mut taken: Vec<u16> = Vec::new();
        taken.extend(self.master_ports.iter().flatten().copied());
        taken.extend(self.replica_ports.iter().flatten().copied());

        let master_ports = match self.master_ports {
            Some(ports) => ports,
            None => allocate_ports(self.masters, &mut taken)?,
        };

        let replica_count = master_ports.len() * self.replicas_per_master;
        let replica_ports = match self.replica_ports {
            Some(ports) => ports,
            None => allocate_ports(replica_count, &mut taken)?,
        };

        let topology = ClusterTopology::new(master_ports, replica_ports)?;

        let servers = topology
            .all_ports()
            .into_iter()
            .map(|port| {
                Arc::new(RedisServer::new(RedisServerOptions {
                    port,
                    cluster_enabled: true,
                    executable: self.executable.clone(),
                    ..Default::default()
                })) as Arc<dyn Bootable>
            })
            .collect();

        RedisCluster::new(servers, topology, RedisConnector, self.timings)
    }
}

fn allocate_ports(count: usize, taken: &mut Vec<u16>) -> Result<Vec<u16>, Error> {
    allocate_ports_with(count, taken, allocate_port)
}

fn allocate_ports_with(
    count: usize,
    taken: &mut Vec<u16>,
    mut probe: impl FnMut() -> std::result::Result<u16, ember_util::port_allocator::Error>,
) -> Result<Vec<u16>, Error> {
    // The allocator can legitimately hand out a repeat after its high-range
    // adjustment; a topology needs distinct ports. An occasional repeat is
    // expected, but a repeat on every attempt means the probe is stuck.
    let max_attempts = count + 32;
    let mut attempts = 0;

    let mut ports = Vec::with_capacity(count);
    while ports.len() < count {
        if attempts >= max_attempts {
            return Err(Error::PortExhaustion {
                needed: count,
                attempts,
            });
        }
        attempts += 1;

        let port = probe()?;
        if !taken.contains(&port) {
            taken.push(port);
            ports.push(port);
        }
    }
    Ok(ports)
}
