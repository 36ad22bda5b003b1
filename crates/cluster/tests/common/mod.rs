//! Shared test doubles for formation tests.
#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ember_bootable::Bootable;
use ember_cluster::{
    ClientError, ClusterTopology, FormationTimings, ProtocolClient, ProtocolConnector,
    RedisCluster,
};
use parking_lot::Mutex;

static INIT: Once = Once::new();

/// Install a global tracing subscriber for test output. Safe to call from
/// every test; only the first call has any effect.
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .init();
    });
}

/// Formation timings with every pause zeroed out.
pub fn instant_timings() -> FormationTimings {
    FormationTimings {
        gossip_per_master: Duration::ZERO,
        replica_meet: Duration::ZERO,
        settle: Duration::ZERO,
    }
}

/// One recorded protocol command, tagged with the node it was issued on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolCall {
    Connect { port: u16 },
    Meet { port: u16, target: u16 },
    AddSlots { port: u16, slots: Vec<u16> },
    NodeId { port: u16 },
    Replicate { port: u16, master_id: String },
}

/// Where to inject a failure into the protocol exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPoint {
    Connect(u16),
    Meet(u16),
    AddSlots(u16),
    Replicate(u16),
}

/// Records every protocol command and optionally fails one of them.
#[derive(Default)]
pub struct MockBackend {
    calls: Mutex<Vec<ProtocolCall>>,
    fail_at: Mutex<Option<FailPoint>>,
}

impl MockBackend {
    pub fn calls(&self) -> Vec<ProtocolCall> {
        self.calls.lock().clone()
    }

    pub fn fail_at(&self, point: FailPoint) {
        *self.fail_at.lock() = Some(point);
    }

    fn record(&self, call: ProtocolCall) {
        self.calls.lock().push(call);
    }

    fn should_fail(&self, point: FailPoint) -> bool {
        *self.fail_at.lock() == Some(point)
    }

    /// The deterministic node id the mock hands out for a port.
    pub fn node_id_for(port: u16) -> String {
        format!("node-{port}")
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    pub backend: Arc<MockBackend>,
}

pub struct MockClient {
    port: u16,
    backend: Arc<MockBackend>,
}

#[async_trait]
impl ProtocolConnector for MockConnector {
    type Client = MockClient;

    async fn connect(&self, port: u16) -> Result<MockClient, ClientError> {
        if self.backend.should_fail(FailPoint::Connect(port)) {
            return Err("injected connect failure".into());
        }
        self.backend.record(ProtocolCall::Connect { port });
        Ok(MockClient {
            port,
            backend: self.backend.clone(),
        })
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn meet(&mut self, _host: &str, target: u16) -> Result<(), ClientError> {
        if self.backend.should_fail(FailPoint::Meet(self.port)) {
            return Err("injected meet failure".into());
        }
        self.backend.record(ProtocolCall::Meet {
            port: self.port,
            target,
        });
        Ok(())
    }

    async fn add_slots(&mut self, slots: &[u16]) -> Result<(), ClientError> {
        if self.backend.should_fail(FailPoint::AddSlots(self.port)) {
            return Err("injected add-slots failure".into());
        }
        self.backend.record(ProtocolCall::AddSlots {
            port: self.port,
            slots: slots.to_vec(),
        });
        Ok(())
    }

    async fn node_id(&mut self) -> Result<String, ClientError> {
        self.backend.record(ProtocolCall::NodeId { port: self.port });
        Ok(MockBackend::node_id_for(self.port))
    }

    async fn replicate(&mut self, node_id: &str) -> Result<(), ClientError> {
        if self.backend.should_fail(FailPoint::Replicate(self.port)) {
            return Err("injected replicate failure".into());
        }
        self.backend.record(ProtocolCall::Replicate {
            port: self.port,
            master_id: node_id.to_string(),
        });
        Ok(())
    }
}

/// In-memory stand-in for a server process.
pub struct MockNode {
    name: String,
    active: AtomicBool,
    stop_attempts: AtomicUsize,
    fail_start: bool,
}

impl MockNode {
    pub fn new(port: u16) -> Arc<Self> {
        Arc::new(Self {
            name: format!("mock-node-{port}"),
            active: AtomicBool::new(false),
            stop_attempts: AtomicUsize::new(0),
            fail_start: false,
        })
    }

    pub fn failing_start(port: u16) -> Arc<Self> {
        Arc::new(Self {
            name: format!("mock-node-{port}"),
            active: AtomicBool::new(false),
            stop_attempts: AtomicUsize::new(0),
            fail_start: true,
        })
    }

    pub fn stop_attempts(&self) -> usize {
        self.stop_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bootable for MockNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.fail_start {
            return Err("injected start failure".into());
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.stop_attempts.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        while self.active.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A cluster wired to mock nodes and a recording protocol backend.
pub struct TestCluster {
    pub cluster: RedisCluster<MockConnector>,
    pub nodes: Vec<Arc<MockNode>>,
    pub backend: Arc<MockBackend>,
}

/// Build a mock-backed cluster over healthy nodes.
pub fn mock_cluster(master_ports: &[u16], replica_ports: &[u16]) -> TestCluster {
    mock_cluster_with(master_ports, replica_ports, |port| MockNode::new(port))
}

/// Build a mock-backed cluster, constructing each node through `make_node`.
pub fn mock_cluster_with(
    master_ports: &[u16],
    replica_ports: &[u16],
    make_node: impl Fn(u16) -> Arc<MockNode>,
) -> TestCluster {
    let backend = Arc::new(MockBackend::default());
    let connector = MockConnector {
        backend: backend.clone(),
    };

    let topology = ClusterTopology::new(master_ports.to_vec(), replica_ports.to_vec()).unwrap();
    let nodes: Vec<Arc<MockNode>> = topology.all_ports().into_iter().map(make_node).collect();
    let servers = nodes
        .iter()
        .map(|node| node.clone() as Arc<dyn Bootable>)
        .collect();

    let cluster = RedisCluster::new(servers, topology, connector, instant_timings()).unwrap();

    TestCluster {
        cluster,
        nodes,
        backend,
    }
}
