//! Streaming subprocess supervision.
//!
//! Every external command the engine runs (git, AI CLIs, lint/test/build)
//! goes through `run_streaming`: output is forwarded line by line to a
//! caller-supplied logger, a hard timeout kills the whole process group, and
//! a cancellation signal is polled every 500ms.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::cancel::CancelSignal;
use crate::errors::ProcessError;

/// Lines retained per stream for failure diagnostics.
pub const TAIL_LINES: usize = 40;
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Time between the graceful terminate signal and the force kill.
pub const KILL_GRACE: Duration = Duration::from_secs(2);
/// Upper bound on draining pipes after exit; orphaned grandchildren may hold them open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

pub type LineLogger = Arc<dyn Fn(StreamKind, &str) + Send + Sync>;

/// Logger that forwards lines to `tracing` at debug level.
pub fn tracing_logger(label: impl Into<String>) -> LineLogger {
    let label = label.into();
    Arc::new(move |stream, line| {
        tracing::debug!(target: "foundry::process", source = %label, stream = stream.as_str(), "{}", line);
    })
}

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// A shell invocation (`sh -c`), used for configured check commands.
    pub fn shell(command: &str, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::new("sh", cwd, timeout).arg("-c").arg(command)
    }

    fn display(&self) -> String {
        if self.program == "sh" && self.args.first().map(String::as_str) == Some("-c") {
            return self.args.get(1).cloned().unwrap_or_default();
        }
        self.program.clone()
    }
}

/// Output of a process that exited with status 0.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
}

/// Non-error outcomes. Cancellation is never conflated with failure.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Exited(ProcessOutput),
    Canceled { reason: String },
}

#[derive(Default)]
struct Tail {
    lines: VecDeque<String>,
}

impl Tail {
    fn push(&mut self, line: String) {
        if self.lines.len() == TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn into_vec(self) -> Vec<String> {
        self.lines.into()
    }
}

enum Stop {
    Exited(std::process::ExitStatus),
    Canceled(String),
    TimedOut,
}

/// Run `spec` to completion, streaming its output to `logger`.
///
/// Returns `Err(NonZeroExit)` with the captured tails on a non-zero exit,
/// `Err(TimedOut)` when the hard timeout elapses, and
/// `Ok(ProcessOutcome::Canceled)` when `cancel` fires first.
pub async fn run_streaming(
    spec: &ProcessSpec,
    cancel: &CancelSignal,
    logger: &LineLogger,
) -> Result<ProcessOutcome, ProcessError> {
    let program = spec.display();
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    let (tx, mut rx) = mpsc::unbounded_channel::<(StreamKind, String)>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(stdout, StreamKind::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(stderr, StreamKind::Stderr, tx.clone()));
    }
    drop(tx);

    let mut stdout = String::new();
    let mut stdout_tail = Tail::default();
    let mut stderr_tail = Tail::default();
    let mut record = |kind: StreamKind, line: String| {
        logger(kind, &line);
        match kind {
            StreamKind::Stdout => {
                stdout.push_str(&line);
                stdout.push('\n');
                stdout_tail.push(line);
            }
            StreamKind::Stderr => stderr_tail.push(line),
        }
    };

    let deadline = Instant::now() + spec.timeout;
    let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut streams_open = true;

    let stop = loop {
        tokio::select! {
            line = rx.recv(), if streams_open => match line {
                Some((kind, line)) => record(kind, line),
                None => streams_open = false,
            },
            status = child.wait() => {
                let status = status.map_err(|source| ProcessError::Io {
                    program: program.clone(),
                    source,
                })?;
                break Stop::Exited(status);
            }
            _ = poll.tick() => {
                if let Some(reason) = cancel.check().await {
                    break Stop::Canceled(reason);
                }
            }
            _ = cancel.token().cancelled() => {
                break Stop::Canceled("canceled in-process".to_string());
            }
            _ = tokio::time::sleep_until(deadline) => break Stop::TimedOut,
        }
    };

    match &stop {
        Stop::Canceled(reason) => {
            tracing::info!(program = %program, reason = %reason, "terminating canceled process");
            terminate(&mut child, KILL_GRACE).await;
        }
        Stop::TimedOut => {
            tracing::warn!(program = %program, timeout = ?spec.timeout, "process timed out, killing");
            terminate(&mut child, Duration::ZERO).await;
        }
        Stop::Exited(_) => {}
    }

    // Pick up whatever the readers still have buffered.
    if streams_open {
        let drain = async {
            while let Some((kind, line)) = rx.recv().await {
                record(kind, line);
            }
        };
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
    }

    let stdout_tail = stdout_tail.into_vec();
    let stderr_tail = stderr_tail.into_vec();
    match stop {
        Stop::Canceled(reason) => Ok(ProcessOutcome::Canceled { reason }),
        Stop::TimedOut => Err(ProcessError::TimedOut {
            program,
            timeout: spec.timeout,
            stdout_tail,
            stderr_tail,
        }),
        Stop::Exited(status) => {
            let exit_code = status.code().unwrap_or(-1);
            if exit_code != 0 {
                return Err(ProcessError::NonZeroExit {
                    program,
                    exit_code,
                    stdout_tail,
                    stderr_tail,
                });
            }
            Ok(ProcessOutcome::Exited(ProcessOutput {
                exit_code,
                stdout,
                stdout_tail,
                stderr_tail,
            }))
        }
    }
}

/// Read `reader` line by line, buffering partial lines until the newline
/// arrives. Invalid UTF-8 is replaced rather than dropped.
async fn pump_lines<R>(reader: R, kind: StreamKind, tx: mpsc::UnboundedSender<(StreamKind, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send((kind, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(stream = kind.as_str(), error = %e, "stream read failed");
                break;
            }
        }
    }
}

/// Terminate the child's process group: SIGTERM, then SIGKILL after `grace`.
/// A zero grace kills immediately.
async fn terminate(child: &mut Child, grace: Duration) {
    if !grace.is_zero() {
        signal_group(child, Signal::Term);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    signal_group(child, Signal::Kill);
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "kill after group signal failed");
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, signal: Signal) {
    let Some(pid) = child.id() else { return };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child leads its own process group (process_group(0) at spawn).
    unsafe {
        libc::killpg(pid as libc::pid_t, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _signal: Signal) {
    let _ = child.start_kill();
}
