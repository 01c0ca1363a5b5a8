//! Stdio transports (newline-delimited JSON).
//!
//! [`StdioTransport`] spawns and supervises a child MCP server: each stdout
//! line is one inbound message, each outbound message is one stdin line.
//! [`StdioServerTransport`] speaks the same framing over the proxy's own
//! stdin/stdout, used when a parent MCP client launched us.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::McpMessage;
use crate::registry::SpawnDescriptor;
use crate::transport::Transport;

/// How long a child gets to exit after stdin closes before it is killed.
pub const CHILD_GRACE_PERIOD: Duration = Duration::from_secs(5);

type Inbound = mpsc::Receiver<BridgeResult<McpMessage>>;

/// Transport over a spawned child process.
///
/// The child runs in its own process group so signals aimed at the proxy do
/// not reach it. Closing the transport drops the child's stdin, waits up to
/// [`CHILD_GRACE_PERIOD`], then kills; the child is always reaped.
pub struct StdioTransport {
    label: String,
    stdin: Mutex<Option<ChildStdin>>,
    inbound: Mutex<Inbound>,
    child: Arc<Mutex<Option<Child>>>,
    closed: CancellationToken,
    exit_code: Arc<StdMutex<Option<i32>>>,
}

impl StdioTransport {
    /// Spawn the child described by `descriptor`.
    ///
    /// The child environment is exactly `descriptor.env`; nothing else leaks
    /// from the proxy. Fails synchronously with `SpawnFailed` when the
    /// executable cannot be started.
    pub fn spawn(descriptor: &SpawnDescriptor, label: impl Into<String>) -> BridgeResult<Self> {
        let label = label.into();

        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args)
            .env_clear()
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &descriptor.cwd {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(server = %label, command = %descriptor.command, args = ?descriptor.args, "Spawning stdio server");

        let mut child = cmd.spawn().map_err(|e| {
            BridgeError::SpawnFailed(format!("{}: {e}", descriptor.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("failed to capture stderr".to_string()))?;

        let child = Arc::new(Mutex::new(Some(child)));
        let closed = CancellationToken::new();
        let exit_code = Arc::new(StdMutex::new(None));

        // Single in-flight message: when the sink blocks, stdout stops
        // being read and backpressure reaches the child through the pipe.
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(stdout_loop(
            stdout,
            tx,
            closed.clone(),
            child.clone(),
            exit_code.clone(),
            label.clone(),
        ));
        tokio::spawn(stderr_loop(stderr, label.clone()));

        Ok(Self {
            label,
            stdin: Mutex::new(Some(stdin)),
            inbound: Mutex::new(rx),
            child,
            closed,
            exit_code,
        })
    }

    /// Exit code of the child, once it has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().expect("exit code lock poisoned")
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: McpMessage) -> BridgeResult<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::TransportClosed);
        }
        if let Some(code) = self.exit_code() {
            return Err(BridgeError::ChildCrashed(format!("exit code {code}")));
        }

        let mut frame = message.to_json();
        frame.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(BridgeError::TransportClosed)?;
        tokio::select! {
            _ = self.closed.cancelled() => Err(BridgeError::TransportClosed),
            result = async {
                stdin.write_all(frame.as_bytes()).await?;
                stdin.flush().await?;
                Ok::<_, std::io::Error>(())
            } => result.map_err(Into::into),
        }
    }

    async fn recv(&self) -> BridgeResult<Option<McpMessage>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            next = inbound.recv() => next.transpose(),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        // Dropping stdin is the graceful termination request: a conforming
        // stdio server exits on EOF.
        self.stdin.lock().await.take();
        reap(&self.child, &self.exit_code, &self.label).await;
    }
}

/// Wait for the child to exit, killing it after the grace period.
async fn reap(
    child: &Mutex<Option<Child>>,
    exit_code: &StdMutex<Option<i32>>,
    label: &str,
) {
    let Some(mut child) = child.lock().await.take() else {
        return;
    };

    let status = match tokio::time::timeout(CHILD_GRACE_PERIOD, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(server = %label, error = %e, "Failed to wait for child");
            None
        }
        Err(_) => {
            warn!(server = %label, "Child did not exit within grace period, killing");
            if let Err(e) = child.kill().await {
                warn!(server = %label, error = %e, "Failed to kill child");
            }
            child.try_wait().ok().flatten()
        }
    };

    if let Some(status) = status {
        let code = status.code().unwrap_or(-1);
        *exit_code.lock().expect("exit code lock poisoned") = Some(code);
        if code == 0 {
            debug!(server = %label, "Child exited cleanly");
        } else {
            warn!(server = %label, exit_code = code, "Child exited with failure");
        }
    }
}

async fn stdout_loop(
    stdout: ChildStdout,
    tx: mpsc::Sender<BridgeResult<McpMessage>>,
    closed: CancellationToken,
    child: Arc<Mutex<Option<Child>>>,
    exit_code: Arc<StdMutex<Option<i32>>>,
    label: String,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = closed.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if tx.send(McpMessage::from_json(trimmed)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(server = %label, "Child stdout closed");
                    break;
                }
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    break;
                }
            }
        }
    }
    // Natural exit: reap here so no zombie outlives the session. Buffered
    // messages stay readable; dropping `tx` then signals end-of-stream.
    reap(&child, &exit_code, &label).await;
}

/// Forward child stderr lines to the log sink; stderr is never parsed.
async fn stderr_loop(stderr: ChildStderr, label: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(server = %label, "{}", line);
    }
}

/// Transport over the proxy's own stdin/stdout.
pub struct StdioServerTransport {
    outgoing: mpsc::Sender<String>,
    inbound: Mutex<Inbound>,
    closed: CancellationToken,
}

impl StdioServerTransport {
    pub fn new() -> Self {
        let closed = CancellationToken::new();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(1);
        let (in_tx, in_rx) = mpsc::channel(1);

        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = reader_closed.cancelled() => return,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            if in_tx.send(McpMessage::from_json(trimmed)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            debug!("stdin closed");
                            return;
                        }
                        Err(e) => {
                            let _ = in_tx.send(Err(e.into())).await;
                            return;
                        }
                    }
                }
            }
        });

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => return,
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else { return };
                        if stdout.write_all(frame.as_bytes()).await.is_err() {
                            return;
                        }
                        if stdout.flush().await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Self {
            outgoing: out_tx,
            inbound: Mutex::new(in_rx),
            closed,
        }
    }
}

impl Default for StdioServerTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for StdioServerTransport {
    async fn send(&self, message: McpMessage) -> BridgeResult<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::TransportClosed);
        }
        let mut frame = message.to_json();
        frame.push('\n');
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| BridgeError::TransportClosed)
    }

    async fn recv(&self) -> BridgeResult<Option<McpMessage>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            next = inbound.recv() => next.transpose(),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
