//! Local subprocess transport.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::{LineTransport, Transport};
use crate::error::{Result, TetherError};

/// How long `close` waits for the child to exit after stdin is closed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Stdio-based MCP transport (for local MCP servers).
///
/// The child is killed when the transport is dropped.
pub struct StdioTransport {
    server: String,
    child: Option<Child>,
    lines: LineTransport<ChildStdout, ChildStdin>,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdioTransport {
    /// Spawn `command` with `args`, extending the inherited environment with `env`.
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TetherError::transport(format!("failed to spawn '{command}' for server '{server}': {e}"))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TetherError::transport("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TetherError::transport("child stdout unavailable"))?;
        let stderr_task = child.stderr.take().map(|stderr| {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "{line}");
                }
            })
        });

        tracing::debug!(server = %server, command, pid = child.id(), "spawned stdio server");

        Ok(Self {
            server: server.to_string(),
            child: Some(child),
            lines: LineTransport::new(stdout, stdin),
            stderr_task,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, message: serde_json::Value) -> Result<()> {
        self.lines.send(message).await
    }

    async fn receive(&mut self) -> Result<serde_json::Value> {
        self.lines.receive().await
    }

    async fn close(&mut self) -> Result<()> {
        // Closing stdin is the polite shutdown signal for stdio servers.
        self.lines.close().await?;
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.server, %status, "stdio server exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(server = %self.server, error = %e, "failed to reap stdio server");
                }
                Err(_) => {
                    tracing::debug!(server = %self.server, "stdio server ignored stdin close; killing");
                    let _ = child.kill().await;
                }
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}
