//! Stdio transport for a tool process.
//!
//! Owns one child process: newline-delimited writes to its stdin, line reads
//! from its stdout, and a bounded tail of its stderr for diagnostics.

use crate::config::ServerConfig;
use crate::error::ToolRpcError;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Number of stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the OS to reap a process after killing it.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Write half and lifecycle owner of a spawned tool process.
///
/// The child itself lives in a waiter task that reaps it and publishes its
/// exit status, so exit is observed even while a grandchild still holds
/// the stdout pipe open.
pub struct ProcessTransport {
    command: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    exit: watch::Receiver<Option<ExitStatus>>,
    kill: CancellationToken,
    stderr_tail: Arc<std::sync::Mutex<VecDeque<String>>>,
    stderr_handle: JoinHandle<()>,
    grace: Duration,
}

/// What the read half of a process produced next.
#[derive(Debug)]
pub enum ReadEvent {
    /// A stdout line, `Ok(None)` at EOF.
    Line(std::io::Result<Option<String>>),
    /// The process exited before another line was available.
    Exited(Option<ExitStatus>),
}

/// Read half of a tool process: its stdout as a stream of lines, plus a
/// watch on the process's exit.
pub struct TransportReader {
    lines: Lines<BufReader<ChildStdout>>,
    exit: watch::Receiver<Option<ExitStatus>>,
}

impl TransportReader {
    /// Read one line from the process's stdout.
    ///
    /// Returns `Ok(None)` at EOF. The read is async, so a process that never
    /// writes only parks this task, never the runtime's worker thread.
    /// Cancel safe.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }

    /// Next stdout line, or the process's exit if that comes first.
    ///
    /// Lines already buffered win over a pending exit.
    pub async fn next_event(&mut self) -> ReadEvent {
        tokio::select! {
            biased;
            line = self.lines.next_line() => ReadEvent::Line(line),
            status = wait_for_exit(&mut self.exit) => ReadEvent::Exited(status),
        }
    }

    /// Resolve once the process has exited. Cancel safe.
    ///
    /// Returns `None` if the exit status was lost with the waiter task.
    pub async fn exited(&mut self) -> Option<ExitStatus> {
        wait_for_exit(&mut self.exit).await
    }
}

async fn wait_for_exit(exit: &mut watch::Receiver<Option<ExitStatus>>) -> Option<ExitStatus> {
    match exit.wait_for(Option::is_some).await {
        Ok(status) => *status,
        Err(_) => None,
    }
}

/// Stdio was not piped as requested; the process is unusable.
fn stdio_not_piped(command: &str) -> ToolRpcError {
    ToolRpcError::SpawnFailed {
        command: command.to_string(),
        source: std::io::Error::other("child process stdio was not piped"),
    }
}

impl ProcessTransport {
    /// Spawn the configured process with piped stdio.
    pub fn spawn(config: &ServerConfig) -> Result<(Self, TransportReader), ToolRpcError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ToolRpcError::SpawnFailed {
            command: config.command.clone(),
            source: e,
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(stdio_not_piped(&config.command));
        };

        let pid = child.id();
        if let Ok(Some(status)) = child.try_wait() {
            return Err(ToolRpcError::ExitedOnStartup {
                command: config.command.clone(),
                stderr: format!("exited immediately with {status}"),
            });
        }

        // Waiter task: owns the child, reaps it, and kills it on request
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let kill_requested = kill.clone();
        let command = config.command.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_requested.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill tool process '{}': {}", command, e);
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(status) => {
                    tracing::debug!("Tool process '{}' exited with {}", command, status);
                    let _ = exit_tx.send(Some(status));
                }
                Err(e) => {
                    tracing::warn!("Failed to wait on tool process '{}': {}", command, e);
                }
            }
        });

        // Stderr task: log each line and keep the last few for error reports
        let stderr_tail = Arc::new(std::sync::Mutex::new(VecDeque::new()));
        let tail_for_task = Arc::clone(&stderr_tail);
        let command = config.command.clone();
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("[{command} stderr] {line}");
                if let Ok(mut tail) = tail_for_task.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        });

        tracing::debug!("Spawned tool process '{}' (pid {:?})", config.command, pid);

        let transport = Self {
            command: config.command.clone(),
            pid,
            stdin: Mutex::new(Some(stdin)),
            exit: exit_rx.clone(),
            kill,
            stderr_tail,
            stderr_handle,
            grace: config.shutdown_grace(),
        };
        let reader = TransportReader {
            lines: BufReader::new(stdout).lines(),
            exit: exit_rx,
        };
        Ok((transport, reader))
    }

    /// Write one newline-terminated message and flush it.
    pub async fn write_line(&self, payload: &str) -> Result<(), ToolRpcError> {
        debug_assert!(!payload.contains('\n'), "message must be a single line");
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(ToolRpcError::ConnectionLost(format!(
                "stdin of '{}' is closed",
                self.command
            )));
        };

        let result = async {
            pipe.write_all(payload.as_bytes()).await?;
            pipe.write_all(b"\n").await?;
            pipe.flush().await
        }
        .await;

        result.map_err(|e| {
            ToolRpcError::ConnectionLost(format!("write to '{}' failed: {e}", self.command))
        })
    }

    /// Whether the child process is still running, as last reported by the OS.
    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Wait up to `timeout` for the process to exit.
    pub async fn exited_within(&self, timeout: Duration) -> Option<ExitStatus> {
        let mut exit = self.exit.clone();
        tokio::time::timeout(timeout, wait_for_exit(&mut exit))
            .await
            .ok()
            .flatten()
    }

    /// Process id, if the OS reported one at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The last lines the process wrote to stderr, oldest first.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    /// Close stdin, wait up to the grace period for the process to exit,
    /// then kill it. Safe to call on a process that has already exited.
    pub async fn terminate(&self) {
        // Dropping stdin sends EOF, the graceful stop signal for stdio servers
        drop(self.stdin.lock().await.take());

        if self.exited_within(self.grace).await.is_none() {
            tracing::warn!(
                "Tool process '{}' did not exit within {}ms, killing",
                self.command,
                self.grace.as_millis()
            );
            self.kill.cancel();
            if self.exited_within(KILL_WAIT).await.is_none() {
                tracing::warn!("Tool process '{}' was not reaped after kill", self.command);
            }
        }
        self.stderr_handle.abort();
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if self.is_alive() {
            self.kill.cancel();
        }
    }
}
