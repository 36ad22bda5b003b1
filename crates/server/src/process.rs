//! Child-process supervision for a managed server.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Grace period between SIGTERM and SIGKILL during shutdown.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// A supervised child process.
///
/// Shutdown is cooperative: cancelling the token asks the monitor task to
/// SIGTERM the child, escalating to SIGKILL after a grace period. The output
/// pumps drain until the child's pipes close, so waiting on the task tracker
/// doubles as waiting for process exit.
pub(crate) struct ServerProcess {
    /// Process ID.
    pid: u32,

    /// Shutdown token to request termination.
    shutdown_token: CancellationToken,

    /// Task tracker for the output pumps of this process.
    task_tracker: TaskTracker,
}

impl ServerProcess {
    /// Whether the process still exists.
    pub(crate) fn is_alive(&self) -> bool {
        signal::kill(Pid::from_raw(self.pid as i32), None).is_ok()
    }

    /// Wait for the process to exit.
    pub(crate) async fn wait(&self) {
        let check_interval = Duration::from_millis(100);
        while self.is_alive() {
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Terminate the process and wait for its output to drain.
    pub(crate) async fn shutdown(self) {
        self.shutdown_token.cancel();
        self.task_tracker.wait().await;
    }
}

/// Spawn `command` with piped stdio, pumping every output line through
/// `handle_line`.
pub(crate) fn spawn(mut command: Command, handle_line: fn(&str)) -> Result<ServerProcess> {
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    debug!("spawning process: {:?}", command);

    let mut child = command.spawn().map_err(Error::Spawn)?;
    let pid = child.id().ok_or(Error::NoPid)?;

    debug!("process spawned with pid: {}", pid);

    let shutdown_token = CancellationToken::new();
    let task_tracker = TaskTracker::new();

    if let Some(stdout) = child.stdout.take() {
        task_tracker.spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                handle_line(&line);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        task_tracker.spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                handle_line(&line);
            }
        });
    }

    // Monitor child process
    let shutdown_token_clone = shutdown_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) if status.success() => {
                        info!("process exited with status: {}", status);
                    }
                    Ok(status) => {
                        error!("process exited with non-zero status: {}", status);
                    }
                    Err(err) => {
                        error!("failed to wait for process: {}", err);
                    }
                }
            }
            () = shutdown_token_clone.cancelled() => {
                info!("shutdown requested, terminating process...");

                if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    error!("failed to send SIGTERM to process: {}", err);
                }

                if let Ok(result) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
                    match result {
                        Ok(status) => info!("process exited with status: {}", status),
                        Err(err) => error!("failed to wait for process: {}", err),
                    }
                } else {
                    error!("timeout waiting for process to exit, killing...");
                    if let Err(err) = child.kill().await {
                        error!("failed to kill process: {}", err);
                    }
                }
            }
        }
    });

    task_tracker.close();

    Ok(ServerProcess {
        pid,
        shutdown_token,
        task_tracker,
    })
}
