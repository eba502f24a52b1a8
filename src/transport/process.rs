//! Child-process transport (stdio pipes)
//!
//! This module implements [`ProcessTransport`], which spawns an MCP server
//! as a child process and communicates with it over its stdin/stdout pipes
//! using newline-delimited JSON framing.
//!
//! # Protocol
//!
//! - Outbound messages are written to the child's stdin as a single JSON
//!   object followed by a newline (`\n`).
//! - Inbound messages are read from the child's stdout, one JSON object per
//!   line; each line is parsed and resolved against the correlator by id.
//!   Unparseable lines are logged and dropped, never fatal to the loop.
//! - The child's stderr is diagnostic-only and logged at `DEBUG` level; it
//!   never participates in correlation.
//!
//! # Supervision
//!
//! A single supervisor task owns the read side. When the child's stdout
//! reaches EOF (process death) while the transport is still running, every
//! in-flight caller is failed, and the process is re-spawned after a fixed
//! 1-second backoff with no attempt cap. A write failure on stdin kills the
//! child so the supervisor observes EOF and performs the same restart; the
//! caller whose request was in flight receives [`McplinkError::ProcessIo`]
//! rather than hanging.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::correlator::{response_key, Correlator};
use crate::error::{McplinkError, Result};
use crate::transport::{method_name, SendOptions, Transport};

/// Fixed delay between restart attempts after process death.
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Bound on joins and child reaping during `close`.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

/// Stdio-based MCP transport that drives a child process.
///
/// # Examples
///
/// ```no_run
/// use std::collections::HashMap;
/// use std::time::Duration;
/// use mcplink::transport::process::ProcessTransport;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = ProcessTransport::spawn(
///     "npx".to_string(),
///     vec!["-y".into(), "@modelcontextprotocol/server-filesystem".into(), "/tmp".into()],
///     HashMap::new(),
///     Duration::from_secs(8),
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ProcessTransport {
    inner: Arc<ProcessInner>,
    /// Handle to the supervisor task; joined with a bounded wait on close.
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Debug)]
struct ProcessInner {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    request_timeout: Duration,
    correlator: Correlator,
    running: AtomicBool,
    /// Write side of the child; replaced on every restart, `None` while the
    /// process is down.
    stdin: Mutex<Option<ChildStdin>>,
    /// The child handle itself, kept for kill/reap.
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
}

impl ProcessTransport {
    /// Spawn the server process and start the supervisor.
    ///
    /// The caller-supplied `env` map is merged into the inherited
    /// environment. Spawn failure is fatal and surfaces synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`McplinkError::Transport`] if the process cannot be spawned
    /// or its stdio pipes are unavailable.
    pub fn spawn(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let (child, stdin, stdout, stderr) = spawn_child(&command, &args, &env)?;

        let inner = Arc::new(ProcessInner {
            command,
            args,
            env,
            request_timeout,
            correlator: Correlator::new(),
            running: AtomicBool::new(true),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            cancel: CancellationToken::new(),
        });

        let supervisor = tokio::spawn(supervise(Arc::clone(&inner), stdout, stderr));

        Ok(Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }
}

#[async_trait::async_trait]
impl Transport for ProcessTransport {
    /// Write one frame to the child's stdin and, unless the caller opts
    /// out, block for the correlated response.
    ///
    /// # Errors
    ///
    /// Returns [`McplinkError::ProcessIo`] when the write fails (the child
    /// is killed so the supervisor restarts it), and
    /// [`McplinkError::Timeout`] when no response arrives in time.
    async fn send(&self, mut message: Value, options: SendOptions) -> Result<Option<Value>> {
        if !self.alive() {
            return Err(McplinkError::Transport("process transport is closed".to_string()).into());
        }

        let method = method_name(&message);
        let mut key = None;
        if options.add_id {
            let id = self.inner.correlator.next_id();
            message["id"] = Value::from(id);
            key = Some(id.to_string());
        }

        let rx = match (&key, options.wait_for_response) {
            (Some(k), true) => Some(self.inner.correlator.register(k.clone()).await),
            _ => None,
        };

        let line = format!("{}\n", serde_json::to_string(&message)?);
        let write_error = {
            let mut guard = self.inner.stdin.lock().await;
            match guard.as_mut() {
                Some(stdin) => match write_line(stdin, &line).await {
                    Ok(()) => None,
                    Err(e) => {
                        // The pipe is broken; drop it so nobody else writes
                        // into a dead child.
                        *guard = None;
                        Some(e)
                    }
                },
                None => Some(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "child stdin unavailable",
                )),
            }
        };

        if let Some(e) = write_error {
            if let Some(k) = &key {
                self.inner.correlator.cancel(k).await;
            }
            // Kill the child so the supervisor observes EOF and restarts it.
            self.inner.kill_child().await;
            return Err(
                McplinkError::ProcessIo(format!("failed to write request to child: {e}")).into(),
            );
        }

        if let (Some(key), Some(rx)) = (key, rx) {
            let response = self
                .inner
                .correlator
                .wait(&key, rx, self.inner.request_timeout, &method)
                .await?;
            return Ok(Some(response));
        }
        Ok(None)
    }

    fn alive(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stop the supervisor, close the pipes, reap the child, and fail all
    /// pending calls. Joins are bounded so teardown is deterministic.
    async fn close(&self) -> Result<()> {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();

        // Closing stdin unblocks the child's own read loop so it can exit.
        self.inner.stdin.lock().await.take();

        if let Some(mut child) = self.inner.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(SHUTDOWN_WAIT, child.wait()).await;
        }

        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = tokio::time::timeout(SHUTDOWN_WAIT, handle).await;
        }

        self.inner.correlator.drain_all().await;
        Ok(())
    }
}

impl Drop for ProcessTransport {
    /// Best-effort termination of the child process on drop.
    ///
    /// On Unix, sends SIGTERM to the child PID. On non-Unix platforms,
    /// calls `start_kill()`. Must not block.
    fn drop(&mut self) {
        if let Ok(mut guard) = self.inner.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                #[cfg(unix)]
                {
                    if let Some(pid) = child.id() {
                        // SAFETY: pid is a valid process ID obtained from
                        // tokio::process::Child.
                        unsafe {
                            libc::kill(pid as libc::pid_t, libc::SIGTERM);
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = child.start_kill();
                }
            }
        }
    }
}

impl ProcessInner {
    /// Tear down the old child (if any) and spawn a fresh one, rewiring the
    /// stdin slot. Returns the new read handles for the supervisor.
    async fn respawn(&self) -> Result<(ChildStdout, ChildStderr)> {
        let (child, stdin, stdout, stderr) = spawn_child(&self.command, &self.args, &self.env)?;
        *self.stdin.lock().await = Some(stdin);
        let previous = self.child.lock().await.replace(child);
        if let Some(mut old) = previous {
            let _ = old.start_kill();
        }
        Ok((stdout, stderr))
    }

    async fn kill_child(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.start_kill();
        }
    }
}

fn spawn_child(
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<(Child, ChildStdin, ChildStdout, ChildStderr)> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| McplinkError::Transport(format!("failed to spawn mcp server `{command}`: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| McplinkError::Transport("child stdin unavailable after spawn".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| McplinkError::Transport("child stdout unavailable after spawn".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| McplinkError::Transport("child stderr unavailable after spawn".to_string()))?;

    Ok((child, stdin, stdout, stderr))
}

/// Supervisor loop: drain stdout until EOF, then fail in-flight callers and
/// re-spawn with a fixed backoff, forever, until the transport closes.
async fn supervise(inner: Arc<ProcessInner>, mut stdout: ChildStdout, mut stderr: ChildStderr) {
    loop {
        let stderr_task = tokio::spawn(drain_stderr(stderr));
        read_stdout(&inner, stdout).await;
        stderr_task.abort();

        if !inner.running.load(Ordering::SeqCst) {
            return;
        }

        // The child died mid-connection: wake everyone still waiting.
        inner.correlator.drain_all().await;
        tracing::warn!(
            "mcp server process exited; restarting in {:?}",
            RESTART_BACKOFF
        );

        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                () = tokio::time::sleep(RESTART_BACKOFF) => {}
            }
            if !inner.running.load(Ordering::SeqCst) {
                return;
            }
            match inner.respawn().await {
                Ok((out, err)) => {
                    stdout = out;
                    stderr = err;
                    break;
                }
                Err(e) => tracing::warn!("failed to restart mcp server process: {e}"),
            }
        }
    }
}

/// Read newline-delimited frames from the child's stdout until EOF or
/// cancellation, resolving the correlator for each.
async fn read_stdout(inner: &ProcessInner, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                dispatch_line(inner, line).await;
            }
            // EOF: the child exited.
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("error reading from child stdout: {e}");
                return;
            }
        }
    }
}

async fn dispatch_line(inner: &ProcessInner, line: &str) {
    let message: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("dropping unparseable frame from child stdout: {e}");
            return;
        }
    };
    match response_key(&message) {
        Some(key) => {
            if !inner.correlator.resolve(&key, message).await {
                tracing::debug!("response for unknown id {key}; ignoring");
            }
        }
        None => tracing::debug!("frame without id from child; ignoring"),
    }
}

/// Forward stderr lines as diagnostics. Per the protocol, stderr output is
/// never an error condition.
async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        tracing::debug!("mcp server stderr: {line}");
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `spawn` returns an error when the executable does not exist.
    #[tokio::test]
    async fn test_spawn_nonexistent_executable_returns_error() {
        let result = ProcessTransport::spawn(
            "/nonexistent/binary/that/does/not/exist".to_string(),
            vec![],
            HashMap::new(),
            Duration::from_secs(1),
        );
        assert!(result.is_err(), "expected error for missing executable");
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("failed to spawn"), "unexpected error: {msg}");
    }

    /// `send` after `close` fails fast instead of writing into a dead pipe.
    #[tokio::test]
    async fn test_send_after_close_returns_error() {
        let transport = ProcessTransport::spawn(
            "cat".to_string(),
            vec![],
            HashMap::new(),
            Duration::from_secs(1),
        )
        .expect("cat should be available");

        transport.close().await.unwrap();
        assert!(!transport.alive());

        let result = transport
            .send(serde_json::json!({"jsonrpc": "2.0", "method": "ping"}), SendOptions::default())
            .await;
        assert!(result.is_err());
    }

    /// A notification send (no id, no wait) returns immediately with no
    /// pending entries left behind.
    #[tokio::test]
    async fn test_notification_leaves_no_pending_entry() {
        let transport = ProcessTransport::spawn(
            "cat".to_string(),
            vec![],
            HashMap::new(),
            Duration::from_secs(1),
        )
        .expect("cat should be available");

        let result = transport
            .send(
                serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
                SendOptions::notification(),
            )
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(transport.inner.correlator.pending_len().await, 0);

        transport.close().await.unwrap();
    }
}
