//! Local static file server bound to a leased port.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::ports::PortLease;

/// Default server command; `{port}` is substituted.
pub const DEFAULT_SERVER_COMMAND: &str = "python3 -m http.server {port} --bind 127.0.0.1";

const READY_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("empty server command")]
    EmptyCommand,
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server exited before listening on port {port}")]
    Exited { port: u16 },
    #[error("server did not listen on port {port} within {waited:?}")]
    NotReady { port: u16, waited: Duration },
}

/// A running server process. Killed on drop, after which the port lease is
/// released.
#[derive(Debug)]
pub struct StaticServer {
    // Field order matters: the child is dropped (killed) before the lease.
    child: Child,
    lease: PortLease,
}

impl StaticServer {
    /// Spawn `template` in `root` and wait until the port accepts connections.
    pub async fn start(
        template: &str,
        root: &Path,
        lease: PortLease,
        ready_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let port = lease.port();
        let command = template.replace("{port}", &port.to_string());
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or(ServerError::EmptyCommand)?;

        let child = Command::new(program)
            .args(parts)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ServerError::Spawn {
                command: command.clone(),
                source,
            })?;

        let mut server = Self { child, lease };
        server.wait_ready(ready_timeout).await?;
        info!(port, root = %root.display(), "static server ready");
        Ok(server)
    }

    async fn wait_ready(&mut self, timeout: Duration) -> Result<(), ServerError> {
        let port = self.port();
        let deadline = Instant::now() + timeout;
        loop {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            if let Ok(Some(status)) = self.child.try_wait() {
                debug!(port, %status, "server process exited early");
                return Err(ServerError::Exited { port });
            }
            if Instant::now() >= deadline {
                return Err(ServerError::NotReady { port, waited: timeout });
            }
            sleep(READY_POLL).await;
        }
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    /// URL of a file served from the root directory.
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}/{}", self.port(), path.trim_start_matches('/'))
    }

    /// Kill the process and wait for it; the lease is released afterwards.
    pub async fn stop(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(port = self.port(), error = %e, "failed to stop static server");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ports::PortAllocator;

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let allocator = PortAllocator::new(47000, 200);
        let lease = allocator.acquire().unwrap();
        let err = StaticServer::start("   ", Path::new("."), lease, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::EmptyCommand));
        assert_eq!(allocator.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let allocator = PortAllocator::new(47000, 200);
        let lease = allocator.acquire().unwrap();
        let err = StaticServer::start(
            "definitely-not-a-real-server-binary {port}",
            Path::new("."),
            lease,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_early_exit_detected() {
        let allocator = PortAllocator::new(47000, 200);
        let lease = allocator.acquire().unwrap();
        let err = StaticServer::start("true {port}", Path::new("."), lease, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Exited { .. }));
        assert_eq!(allocator.leased_count(), 0);
    }
}
