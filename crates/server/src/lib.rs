//! Configures and runs ephemeral `redis-server` processes for testing.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod process;

pub use error::Error;

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use ember_bootable::Bootable;
use regex::Regex;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::process::ServerProcess;

/// Regex pattern for matching Redis server log lines, e.g.
/// `7:M 23 Apr 2024 10:21:32.488 * Ready to accept connections tcp`
static LOG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+:[A-Z] \d{1,2} \w{3} \d{4} \d{2}:\d{2}:\d{2}\.\d{3} ([.\-*#]) (.*)$")
        .expect("Invalid regex pattern")
});

/// How often the readiness probe retries a TCP connect.
const READY_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Options for configuring a `RedisServer`.
#[derive(Clone, Debug)]
pub struct RedisServerOptions {
    /// The port to listen for client connections on.
    pub port: u16,

    /// The address to bind to.
    pub bind: String,

    /// Whether to start the server in cluster mode.
    pub cluster_enabled: bool,

    /// Optional path to the redis-server binary if it is not in the PATH.
    pub executable: Option<PathBuf>,

    /// The directory to store data in. A temporary directory is used when
    /// unset, and removed again on shutdown.
    pub store_dir: Option<PathBuf>,

    /// How long to wait for the server to accept connections after spawning.
    pub ready_timeout: Duration,
}

impl Default for RedisServerOptions {
    fn default() -> Self {
        Self {
            port: 6379,
            bind: "127.0.0.1".to_string(),
            cluster_enabled: false,
            executable: None,
            store_dir: None,
            ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Runs a single `redis-server` process.
///
/// The process is started with persistence disabled so every run begins from
/// an empty keyspace. Startup blocks until the server accepts TCP
/// connections or the ready timeout elapses.
#[derive(Clone)]
pub struct RedisServer {
    name: String,
    options: RedisServerOptions,
    process: Arc<Mutex<Option<ServerProcess>>>,
    scratch_dir: Arc<Mutex<Option<TempDir>>>,
}

impl RedisServer {
    /// Creates a new instance of `RedisServer`.
    #[must_use]
    pub fn new(options: RedisServerOptions) -> Self {
        Self {
            name: format!("redis-server-{}", options.port),
            options,
            process: Arc::new(Mutex::new(None)),
            scratch_dir: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns the port the server listens on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.options.port
    }

    /// Starts the server and waits for it to accept connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is already started, the binary cannot
    /// be found, the process cannot be spawned, or it does not come up
    /// within the ready timeout.
    pub async fn start(&self) -> Result<(), Error> {
        let mut guard = self.process.lock().await;
        if guard.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let store_dir = self.prepare_store_dir().await?;
        let command = self.build_command(&store_dir)?;

        debug!("starting redis-server on port {}...", self.options.port);

        let process = process::spawn(command, handle_log_line)?;

        if !wait_until_listening(
            &self.options.bind,
            self.options.port,
            self.options.ready_timeout,
        )
        .await
        {
            process.shutdown().await;
            return Err(Error::StartupTimeout(self.options.port));
        }

        info!("redis-server listening on port {}", self.options.port);
        guard.replace(process);

        Ok(())
    }

    /// Shuts down the server. A no-op when the server is not running.
    pub async fn stop(&self) {
        let taken_process = self.process.lock().await.take();
        if let Some(process) = taken_process {
            info!("redis-server on port {} shutting down...", self.options.port);
            process.shutdown().await;
            info!("redis-server on port {} shut down", self.options.port);
        } else {
            debug!("no running redis-server to shut down");
        }

        // Scratch dir is removed only after the process has exited.
        self.scratch_dir.lock().await.take();
    }

    /// Whether the server process is currently alive.
    pub async fn is_running(&self) -> bool {
        self.process
            .lock()
            .await
            .as_ref()
            .is_some_and(ServerProcess::is_alive)
    }

    async fn prepare_store_dir(&self) -> Result<PathBuf, Error> {
        if let Some(dir) = &self.options.store_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(Error::WorkingDir)?;
            return Ok(dir.clone());
        }

        let scratch = TempDir::new().map_err(Error::WorkingDir)?;
        let path = scratch.path().to_path_buf();
        self.scratch_dir.lock().await.replace(scratch);
        Ok(path)
    }

    fn build_command(&self, store_dir: &Path) -> Result<Command, Error> {
        let executable = match &self.options.executable {
            Some(path) => path.clone(),
            None => which::which("redis-server")?,
        };

        let mut command = Command::new(executable);
        command.args(self.args(store_dir));
        Ok(command)
    }

    fn args(&self, store_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            self.options.port.to_string(),
            "--bind".to_string(),
            self.options.bind.clone(),
            "--dir".to_string(),
            store_dir.to_string_lossy().to_string(),
            "--save".to_string(),
            String::new(),
            "--appendonly".to_string(),
            "no".to_string(),
        ];

        if self.options.cluster_enabled {
            args.extend([
                "--cluster-enabled".to_string(),
                "yes".to_string(),
                "--cluster-config-file".to_string(),
                format!("nodes-{}.conf", self.options.port),
            ]);
        }

        args
    }
}

#[async_trait]
impl Bootable for RedisServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Self::start(self).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.stop().await;
        Ok(())
    }

    async fn is_active(&self) -> bool {
        self.is_running().await
    }

    async fn wait(&self) {
        if let Some(process) = self.process.lock().await.as_ref() {
            process.wait().await;
        }
    }
}

/// Poll a TCP connect against the server until it answers or the timeout
/// elapses.
async fn wait_until_listening(bind: &str, port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if TcpStream::connect((bind, port)).await.is_ok() {
            return true;
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }

        tokio::time::sleep(READY_CHECK_INTERVAL).await;
    }
}

/// Re-emit a Redis log line at the matching tracing level.
fn handle_log_line(line: &str) {
    match parse_log_line(line) {
        Some(("*", message)) => info!(target: "redis-server", "{}", message),
        Some(("#", message)) => warn!(target: "redis-server", "{}", message),
        Some((_, message)) => debug!(target: "redis-server", "{}", message),
        // Startup banner and other unprefixed output.
        None => debug!(target: "redis-server", "{}", line),
    }
}

fn parse_log_line(line: &str) -> Option<(&str, &str)> {
    let caps = LOG_REGEX.captures(line)?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}
