//! Wire-level cluster protocol client.
//!
//! Formation never talks RESP directly; it goes through the
//! [`ProtocolConnector`] / [`ProtocolClient`] seam so tests can substitute a
//! recording mock. The production implementation is a thin wrapper over the
//! `redis` crate.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::debug;

/// Error type carried across the protocol-client seam.
pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// The cluster-management commands formation relies on.
///
/// Clients are short-lived: one is opened per node, used for a bounded
/// sequence of commands, and dropped before the next node is touched.
/// Dropping the client closes the connection, including on error paths.
#[async_trait]
pub trait ProtocolClient: Send {
    /// Introduce this node to the cluster member at `host:port`.
    async fn meet(&mut self, host: &str, port: u16) -> Result<(), ClientError>;

    /// Claim ownership of `slots` on this node. The slots are sent as a
    /// single batched command; a successful return means the server
    /// acknowledged the whole batch.
    async fn add_slots(&mut self, slots: &[u16]) -> Result<(), ClientError>;

    /// Read this node's cluster-assigned node id.
    async fn node_id(&mut self) -> Result<String, ClientError>;

    /// Make this node a replica of the master with the given node id.
    async fn replicate(&mut self, node_id: &str) -> Result<(), ClientError>;
}

/// Opens protocol clients against individual nodes.
#[async_trait]
pub trait ProtocolConnector: Send + Sync + 'static {
    /// The client type produced by this connector.
    type Client: ProtocolClient;

    /// Open a client against the node listening on `port`.
    async fn connect(&self, port: u16) -> Result<Self::Client, ClientError>;
}

/// Production connector speaking RESP to localhost nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct RedisConnector;

/// Protocol client backed by the `redis` crate.
pub struct RedisProtocolClient {
    connection: MultiplexedConnection,
}

#[async_trait]
impl ProtocolConnector for RedisConnector {
    type Client = RedisProtocolClient;

    async fn connect(&self, port: u16) -> Result<Self::Client, ClientError> {
        let client = redis::Client::open(format!("redis://127.0.0.1:{port}/"))?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(RedisProtocolClient { connection })
    }
}

#[async_trait]
impl ProtocolClient for RedisProtocolClient {
    async fn meet(&mut self, host: &str, port: u16) -> Result<(), ClientError> {
        debug!("CLUSTER MEET {} {}", host, port);
        redis::cmd("CLUSTER")
            .arg("MEET")
            .arg(host)
            .arg(port)
            .query_async::<()>(&mut self.connection)
            .await?;
        Ok(())
    }

    async fn add_slots(&mut self, slots: &[u16]) -> Result<(), ClientError> {
        debug!("CLUSTER ADDSLOTS ({} slots)", slots.len());
        redis::cmd("CLUSTER")
            .arg("ADDSLOTS")
            .arg(slots)
            .query_async::<()>(&mut self.connection)
            .await?;
        Ok(())
    }

    async fn node_id(&mut self) -> Result<String, ClientError> {
        let id = redis::cmd("CLUSTER")
            .arg("MYID")
            .query_async::<String>(&mut self.connection)
            .await?;
        Ok(id)
    }

    async fn replicate(&mut self, node_id: &str) -> Result<(), ClientError> {
        debug!("CLUSTER REPLICATE {}", node_id);
        redis::cmd("CLUSTER")
            .arg("REPLICATE")
            .arg(node_id)
            .query_async::<()>(&mut self.connection)
            .await?;
        Ok(())
    }
}
