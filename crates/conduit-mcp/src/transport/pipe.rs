//! Subprocess transport: newline-delimited JSON over stdin/stdout.

use super::{emit_frame, EventSender, LineBuffer, TransportEvent};
use crate::config::PipeConfig;
use conduit_core::{ConduitError, ConduitResult};
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for stdout to drain after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Newline-delimited JSON over a child process's stdio.
pub struct PipeTransport {
    server: String,
    config: PipeConfig,
    writer: Option<mpsc::UnboundedSender<String>>,
    kill: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl PipeTransport {
    /// Unspawned transport for `server`.
    pub fn new(server: String, config: PipeConfig) -> Self {
        Self {
            server,
            config,
            writer: None,
            kill: None,
            supervisor: None,
            connected: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the server subprocess and start the reader, writer and exit watcher.
    pub async fn connect(&mut self, events: EventSender) -> ConduitResult<()> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, val) in &self.config.env {
            cmd.env(key, val);
        }
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ConduitError::connection(
                &self.server,
                format!("failed to spawn '{}': {e}", self.config.command),
            )
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConduitError::connection(&self.server, "stdin not available"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConduitError::connection(&self.server, "stdout not available"))?;

        if let Some(stderr) = child.stderr.take() {
            let server = self.server.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, line = %line, "Server stderr");
                }
            });
        }

        self.closing.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        // Writer task: queued frames go out one per line.
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();
        {
            let server = self.server.clone();
            let events = events.clone();
            let connected = self.connected.clone();
            let closing = self.closing.clone();
            tokio::spawn(async move {
                let mut stdin = stdin;
                while let Some(line) = write_rx.recv().await {
                    let result: std::io::Result<()> = async {
                        stdin.write_all(line.as_bytes()).await?;
                        stdin.write_all(b"\n").await?;
                        stdin.flush().await
                    }
                    .await;
                    if let Err(e) = result {
                        if !closing.load(Ordering::SeqCst) {
                            warn!(server = %server, error = %e, "Failed to write to server stdin");
                            connected.store(false, Ordering::SeqCst);
                            let _ = events.send(TransportEvent::Error {
                                message: format!("[{server}] write failed: {e}"),
                                fatal: true,
                            });
                        }
                        break;
                    }
                }
            });
        }

        // Supervisor: owns the child, waits for exit or an explicit kill.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let server = self.server.clone();
        let connected = self.connected.clone();
        let closing = self.closing.clone();
        let supervisor = tokio::spawn(async move {
            let reader = tokio::spawn(read_loop(stdout, server.clone(), events.clone()));
            tokio::select! {
                status = child.wait() => {
                    let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
                    connected.store(false, Ordering::SeqCst);
                    if closing.load(Ordering::SeqCst) {
                        return;
                    }
                    let reason = match status {
                        Ok(status) if status.success() => {
                            info!(server = %server, "Server process exited");
                            format!("process exited: {status}")
                        }
                        Ok(status) => {
                            warn!(server = %server, status = %status, "Server process terminated abnormally");
                            let message = format!("[{server}] process terminated: {status}");
                            let _ = events.send(TransportEvent::Error { message: message.clone(), fatal: true });
                            message
                        }
                        Err(e) => {
                            let message = format!("[{server}] failed to wait on process: {e}");
                            let _ = events.send(TransportEvent::Error { message: message.clone(), fatal: true });
                            message
                        }
                    };
                    let _ = events.send(TransportEvent::Closed { reason: Some(reason) });
                }
                _ = kill_rx => {
                    reader.abort();
                    if let Err(e) = child.kill().await {
                        debug!(server = %server, error = %e, "Kill failed (process already gone?)");
                    }
                    connected.store(false, Ordering::SeqCst);
                }
            }
        });

        self.writer = Some(write_tx);
        self.kill = Some(kill_tx);
        self.supervisor = Some(supervisor);

        info!(server = %self.server, command = %self.config.command, "Server process spawned");
        Ok(())
    }

    /// Kill the child and stop the reader tasks.
    pub async fn disconnect(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.writer = None;
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, handle).await;
        }
    }

    /// Queue a line for the child's stdin.
    pub fn send(&self, message: Value) -> ConduitResult<()> {
        let writer = self
            .writer
            .as_ref()
            .filter(|_| self.is_connected())
            .ok_or_else(|| ConduitError::connection(&self.server, "not connected"))?;
        let line = serde_json::to_string(&message)?;
        writer
            .send(line)
            .map_err(|_| ConduitError::connection(&self.server, "not connected"))
    }

    /// Whether the child is running.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn read_loop(mut stdout: ChildStdout, server: String, events: EventSender) {
    let mut lines = LineBuffer::default();
    let mut chunk = vec![0u8; 8192];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => {
                debug!(server = %server, "Server stdout closed");
                break;
            }
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    emit_frame(&events, &server, &line);
                }
            }
            Err(e) => {
                warn!(server = %server, error = %e, "Error reading server stdout");
                break;
            }
        }
    }
    if let Some(tail) = lines.finish() {
        emit_frame(&events, &server, &tail);
    }
}
