//! Abstract interface for bootable services.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use async_trait::async_trait;

/// Trait for bootable services.
///
/// Implemented by anything with a start/stop lifecycle, from a single server
/// process to a whole cluster of them. Starting an already-running service
/// is an error; shutting down a stopped one is not.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// Get the name of the bootable service.
    fn name(&self) -> &str;

    /// Start the bootable service. Resolves once the service is ready to
    /// accept connections, not merely once the process exists.
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Shutdown the bootable service. A no-op when the service is not running.
    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Whether the service is currently live.
    async fn is_active(&self) -> bool;

    /// Wait for the bootable service to exit.
    async fn wait(&self);
}
