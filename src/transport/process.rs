// src/transport/process.rs

//! Bridge subprocess transport.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::errors::{CellRunnerError, Result};
use crate::protocol::{LineFramer, Outbound, decode_batch, encode_line};

use super::backend::{KernelCommand, KernelTransport, TransportEvent};

/// Capacity of the event channel. A full channel stalls the reader, which
/// in turn lets the pipe apply backpressure to the bridge.
const EVENT_CHANNEL_CAPACITY: usize = 64;

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// How long the exit watcher waits for stdout to drain after the process
/// has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Transport over a spawned bridge process.
///
/// Owns the child's stdin/stdout/stderr and (through the exit watcher task)
/// its process handle; nothing else touches them.
pub struct ProcessTransport {
    /// Encoded lines for the writer task. `None` once closed.
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    /// stdout and stderr reader tasks.
    readers: Vec<AbortHandle>,
    /// Asks the exit watcher to signal the process.
    terminate: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
    closed: bool,
}

impl std::fmt::Debug for ProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTransport")
            .field("pid", &self.pid)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ProcessTransport {
    /// Spawn the bridge described by `command`.
    ///
    /// Fails immediately when the executable cannot be resolved or the
    /// script does not exist. Must be called inside a Tokio runtime.
    pub fn spawn(command: &KernelCommand) -> Result<Self> {
        let program = which::which(&command.program).map_err(|e| {
            CellRunnerError::ExecutableNotFound(format!("{}: {e}", command.program))
        })?;

        if let Some(script) = &command.script {
            if !script.exists() {
                return Err(CellRunnerError::ScriptNotFound(script.clone()));
            }
        }

        let mut cmd = Command::new(&program);
        if let Some(script) = &command.script {
            cmd.arg(script);
        }
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            CellRunnerError::SpawnFailed(format!("{}: {e}", program.display()))
        })?;

        let pid = child.id();
        let stdin = take_pipe(child.stdin.take(), "stdin")?;
        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr = take_pipe(child.stderr.take(), "stderr")?;

        info!(program = %program.display(), ?pid, "spawned kernel bridge");

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (terminate_tx, terminate_rx) = oneshot::channel();

        let writer = tokio::spawn(write_loop(stdin, write_rx));
        let stdout_task = tokio::spawn(read_loop(stdout, events_tx.clone()));
        let stderr_task = tokio::spawn(stderr_loop(stderr));

        let readers = vec![stdout_task.abort_handle(), stderr_task.abort_handle()];

        tokio::spawn(watch_exit(
            child,
            terminate_rx,
            ExitStreams {
                stdout: stdout_task,
                stderr: stderr_task,
                writer,
            },
            events_tx,
        ));

        Ok(Self {
            writer: Some(write_tx),
            events: Some(events_rx),
            readers,
            terminate: Some(terminate_tx),
            pid,
            closed: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl KernelTransport for ProcessTransport {
    fn send(&mut self, message: &Outbound) {
        let Some(writer) = self.writer.as_ref() else {
            debug!(kind = message.kind(), "transport closed; dropping outbound message");
            return;
        };

        match encode_line(message) {
            Ok(line) => {
                if writer.send(line).is_err() {
                    debug!(kind = message.kind(), "bridge stdin gone; dropping outbound message");
                }
            }
            Err(e) => warn!(kind = message.kind(), error = %e, "failed to encode outbound message"),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // The writer drains what is already queued (e.g. `shutdown`), then
        // drops stdin.
        self.writer.take();
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        if let Some(terminate) = self.terminate.take() {
            let _ = terminate.send(());
        }
        debug!(pid = ?self.pid, "transport closed");
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T> {
    pipe.ok_or_else(|| CellRunnerError::SpawnFailed(format!("failed to capture bridge {name}")))
}

async fn write_loop(mut stdin: ChildStdin, mut lines: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = stdin.write_all(&line).await {
            warn!(error = %e, "failed writing to bridge stdin");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(error = %e, "failed flushing bridge stdin");
            break;
        }
    }
    debug!("bridge stdin writer finished");
}

/// Read stdout, emitting at most one event per read.
///
/// All complete lines of a read are extracted and decoded before the single
/// batch is handed on, so a burst of output never fans out into one
/// scheduled operation per line.
async fn read_loop(mut stdout: ChildStdout, events: mpsc::Sender<TransportEvent>) {
    let mut framer = LineFramer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed reading bridge stdout");
                break;
            }
        };

        let lines = framer.push(&chunk[..n]);
        if lines.is_empty() {
            continue;
        }
        let messages = decode_batch(lines);
        if messages.is_empty() {
            continue;
        }
        if events.send(TransportEvent::Messages(messages)).await.is_err() {
            debug!("transport consumer gone; stopping stdout reader");
            return;
        }
    }

    if let Some(rest) = framer.finish() {
        let messages = decode_batch(vec![rest]);
        if !messages.is_empty() {
            let _ = events.send(TransportEvent::Messages(messages)).await;
        }
    }
    debug!("bridge stdout reached end of stream");
}

async fn stderr_loop(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    debug!("bridge stderr: {}", trimmed);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed reading bridge stderr");
                break;
            }
        }
    }
}

struct ExitStreams {
    stdout: JoinHandle<()>,
    stderr: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Own the child until it exits, then close every stream and report.
async fn watch_exit(
    mut child: Child,
    mut terminate: oneshot::Receiver<()>,
    streams: ExitStreams,
    events: mpsc::Sender<TransportEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        request = &mut terminate => {
            if request.is_ok() {
                request_termination(&mut child);
            }
            child.wait().await
        }
    };

    let ExitStreams {
        stdout,
        stderr,
        writer,
    } = streams;

    // Let stdout deliver what the process wrote before exiting.
    let stdout_abort = stdout.abort_handle();
    if tokio::time::timeout(DRAIN_GRACE, stdout).await.is_err() {
        stdout_abort.abort();
    }
    stderr.abort();
    writer.abort();

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(error = %e, "failed waiting for bridge process");
            None
        }
    };
    info!(?code, "kernel bridge exited");

    let _ = events.send(TransportEvent::Exited { code }).await;
}

/// Graceful termination: SIGTERM on unix, so the bridge can shut its kernel
/// down.
#[cfg(unix)]
fn request_termination(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        warn!(pid, "bridge pid out of range; not signalling");
        return;
    };
    // SAFETY: `pid` belongs to a child we still own and have not reaped
    // (`id()` returns `None` after reaping), so it cannot name another process.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM to bridge failed");
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "failed to terminate bridge");
    }
}
