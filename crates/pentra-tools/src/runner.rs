//! Pseudo-terminal command execution with streaming output and cancellation.

use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, Utc};
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::output::{Utf8Chunker, clean_output};

const READ_BUF_SIZE: usize = 4096;
/// How long to keep draining output after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
/// How long to wait for a killed child to be reaped.
const REAP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// No pseudo-terminal could be allocated; no command can run at all.
    #[error("pseudo-terminal unavailable: {0}")]
    PtyUnavailable(String),

    #[error("runner task failed: {0}")]
    Task(String),
}

/// Terminal status of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandStatus {
    Exited { code: u32 },
    SpawnFailure { reason: String },
    TimedOut,
    Cancelled,
}

impl CommandStatus {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }

    /// Whether the process actually ran and produced output worth parsing.
    #[must_use]
    pub fn ran(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::TimedOut)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with code {code}"),
            Self::SpawnFailure { reason } => write!(f, "spawn failure: {reason}"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    /// Raw terminal output, escape sequences included.
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A running command: incremental output plus its eventual outcome.
pub struct Execution {
    chunks: mpsc::UnboundedReceiver<String>,
    done: JoinHandle<ExecutionOutcome>,
    pid: Option<u32>,
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution").field("pid", &self.pid).finish_non_exhaustive()
    }
}

impl Execution {
    /// Next output chunk, `None` once the process output is exhausted.
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.chunks.recv().await
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the terminal status. Chunks not yet consumed are still part
    /// of the outcome's output.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::Task` if the supervising task panicked.
    pub async fn finish(self) -> Result<ExecutionOutcome, RunnerError> {
        self.done.await.map_err(|e| RunnerError::Task(e.to_string()))
    }

    fn immediate(outcome: ExecutionOutcome) -> Self {
        let (_tx, chunks) = mpsc::unbounded_channel();
        Self {
            chunks,
            done: tokio::spawn(async move { outcome }),
            pid: None,
        }
    }
}

/// Spawns shell commands attached to a pseudo-terminal.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    shell: String,
    default_timeout: Option<Duration>,
    size: (u16, u16),
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(&RunnerConfig::default())
    }
}

impl CommandRunner {
    #[must_use]
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            default_timeout: (config.timeout > 0).then(|| Duration::from_secs(config.timeout)),
            size: (config.rows, config.cols),
        }
    }

    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Start `command` under `<shell> -c` in a fresh PTY.
    ///
    /// `timeout` overrides the configured default. Cancelling `cancel` kills
    /// the whole process group. A command that cannot be spawned still yields
    /// an `Execution`, finishing immediately with `SpawnFailure`.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::PtyUnavailable` if no pseudo-terminal can be opened.
    pub fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Execution, RunnerError> {
        let started_at = Utc::now();
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: self.size.0,
                cols: self.size.1,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RunnerError::PtyUnavailable(format!("{e:#}")))?;

        let mut builder = CommandBuilder::new(&self.shell);
        builder.arg("-c");
        builder.arg(command);
        builder.env("TERM", "xterm-256color");
        if let Ok(cwd) = std::env::current_dir() {
            builder.cwd(cwd);
        }

        let child = match pair.slave.spawn_command(builder) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(command, "spawn failed: {e:#}");
                return Ok(Execution::immediate(ExecutionOutcome {
                    status: CommandStatus::SpawnFailure {
                        reason: format!("{e:#}"),
                    },
                    output: String::new(),
                    started_at,
                    finished_at: Utc::now(),
                }));
            }
        };
        // The parent's slave handle must close so the reader sees EOF when the child exits.
        drop(pair.slave);

        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                let mut killer = child.clone_killer();
                let _ = killer.kill();
                return Err(RunnerError::PtyUnavailable(format!("{e:#}")));
            }
        };

        let pid = child.process_id();
        tracing::info!(command, pid, "command started");

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || read_pty(reader, &raw_tx))
            .map_err(|e| RunnerError::PtyUnavailable(e.to_string()))?;

        let (out_tx, chunks) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            killer: child.clone_killer(),
            pid,
            master: pair.master,
            raw_rx,
            out_tx,
            output: String::new(),
        };
        let timeout = timeout.or(self.default_timeout);
        let done = tokio::spawn(supervisor.run(child, timeout, cancel, started_at));

        Ok(Execution { chunks, done, pid })
    }
}

fn read_pty(mut reader: Box<dyn Read + Send>, tx: &mpsc::UnboundedSender<String>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut chunker = Utf8Chunker::default();
    loop {
        match reader.read(&mut buf) {
            // EIO on Linux once the slave side is fully closed
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = chunker.push(&buf[..n]);
                if !text.is_empty() && tx.send(text).is_err() {
                    return;
                }
            }
        }
    }
    let rest = chunker.finish();
    if !rest.is_empty() {
        let _ = tx.send(rest);
    }
}

struct Supervisor {
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    raw_rx: mpsc::UnboundedReceiver<String>,
    out_tx: mpsc::UnboundedSender<String>,
    output: String,
}

impl Supervisor {
    fn forward(&mut self, chunk: String) {
        self.output.push_str(&chunk);
        let _ = self.out_tx.send(chunk);
    }

    async fn run(
        mut self,
        mut child: Box<dyn Child + Send + Sync>,
        timeout: Option<Duration>,
        cancel: CancellationToken,
        started_at: DateTime<Utc>,
    ) -> ExecutionOutcome {
        let wait = tokio::task::spawn_blocking(move || child.wait());
        tokio::pin!(wait);

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let mut reader_open = true;
        let status = loop {
            tokio::select! {
                chunk = self.raw_rx.recv(), if reader_open => match chunk {
                    Some(chunk) => self.forward(chunk),
                    None => reader_open = false,
                },
                joined = &mut wait => break exit_status(joined),
                () = &mut expired => {
                    tracing::warn!(pid = self.pid, "command timed out, killing process group");
                    self.kill_group();
                    break CommandStatus::TimedOut;
                }
                () = cancel.cancelled() => {
                    tracing::info!(pid = self.pid, "command cancelled, killing process group");
                    self.kill_group();
                    break CommandStatus::Cancelled;
                }
            }
        };

        if matches!(status, CommandStatus::TimedOut | CommandStatus::Cancelled)
            && tokio::time::timeout(REAP_GRACE, &mut wait).await.is_err()
        {
            tracing::error!(pid = self.pid, "killed child was not reaped in time");
        }

        if reader_open {
            let drain_until = tokio::time::Instant::now() + DRAIN_GRACE;
            while let Ok(Some(chunk)) =
                tokio::time::timeout_at(drain_until, self.raw_rx.recv()).await
            {
                self.forward(chunk);
            }
        }
        drop(self.master);

        let status = match status {
            CommandStatus::Exited { code } => shell_status(code, &self.output),
            other => other,
        };
        tracing::info!(pid = self.pid, %status, bytes = self.output.len(), "command finished");
        ExecutionOutcome {
            status,
            output: self.output,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn kill_group(&mut self) {
        if let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;
            // The PTY child is a session leader, so its pid is also its process group id.
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                tracing::debug!(pid, "killpg failed: {e}");
            }
        }
        if let Err(e) = self.killer.kill() {
            tracing::debug!("child kill failed: {e}");
        }
    }
}

fn exit_status(
    joined: Result<std::io::Result<portable_pty::ExitStatus>, tokio::task::JoinError>,
) -> CommandStatus {
    match joined {
        Ok(Ok(status)) => CommandStatus::Exited {
            code: status.exit_code(),
        },
        Ok(Err(e)) => CommandStatus::SpawnFailure {
            reason: format!("wait failed: {e}"),
        },
        Err(e) => CommandStatus::SpawnFailure {
            reason: format!("wait task failed: {e}"),
        },
    }
}

/// The shell reports unrunnable commands through exit codes 126 and 127
/// instead of failing the spawn. Those codes only mean a spawn failure when
/// the shell's own diagnostic is everything the command printed; a chain
/// whose earlier parts produced output still counts as having run.
fn shell_status(code: u32, output: &str) -> CommandStatus {
    let reason = match code {
        126 => "permission denied or not executable",
        127 => "command not found",
        _ => return CommandStatus::Exited { code },
    };
    let cleaned = clean_output(output);
    let only_diagnostics = cleaned
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .all(is_shell_diagnostic);
    if only_diagnostics {
        CommandStatus::SpawnFailure {
            reason: reason.into(),
        }
    } else {
        CommandStatus::Exited { code }
    }
}

fn is_shell_diagnostic(line: &str) -> bool {
    const MARKERS: [&str; 4] = [
        "not found",
        "No such file or directory",
        "Permission denied",
        "cannot execute",
    ];
    MARKERS.iter().any(|marker| line.contains(marker))
}
