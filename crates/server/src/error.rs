use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing a server process.
#[derive(Debug, Error)]
pub enum Error {
    /// The server has already been started.
    #[error("redis server already started")]
    AlreadyStarted,

    /// No usable redis-server binary was found.
    #[error("could not locate a redis-server binary: {0}")]
    BinaryNotFound(#[from] which::Error),

    /// The server did not accept connections within the ready timeout.
    #[error("redis server on port {0} did not accept connections in time")]
    StartupTimeout(u16),

    /// The server process could not be spawned.
    #[error("failed to spawn redis server: {0}")]
    Spawn(std::io::Error),

    /// The spawned process handle carried no pid.
    #[error("spawned redis server reported no pid")]
    NoPid,

    /// The working directory could not be created.
    #[error("failed to prepare working directory: {0}")]
    WorkingDir(std::io::Error),
}
