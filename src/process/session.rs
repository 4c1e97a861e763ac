//! One interactive program instance wrapped as a request/response API.
//!
//! A session owns:
//! - the child's stdin, written one command line at a time;
//! - a [`Turns`] source framed from the child's stdout;
//! - a watcher task that owns the [`Child`], reaps it, and publishes the
//!   [`ExitState`] on a `watch` channel;
//! - a stderr task that forwards diagnostic lines to the log.
//!
//! The child runs with a cleared environment restricted to
//! [`ALLOWED_ENV_VARS`], so the Slack token never reaches it, and with
//! `kill_on_drop(true)` so a dropped session never leaves it behind.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::GlobalConfig;
use crate::process::framer::{self, Turns};
use crate::{AppError, Result};

/// Environment variables inherited by the spawned program.
///
/// Every other variable is stripped via `env_clear()` before launch.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "TERM",
    "LANG",
    "LC_ALL",
    "TMPDIR",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "COMSPEC",
];

/// Upper bound on a single stderr line kept for logging.
const MAX_STDERR_LINE: usize = 8 * 1024;

/// How long `close` waits for the watcher to confirm the kill.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for a final turn once the program has exited.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Configuration for starting a session's program.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Program binary (e.g. `dfrotz`).
    pub executable: String,
    /// Arguments, typically the data file.
    pub args: Vec<String>,
    /// Working directory; inherits the server's when `None`.
    pub working_dir: Option<PathBuf>,
    /// Output silence that ends a turn.
    pub quiescence: Duration,
    /// Maximum wait for the banner turn.
    pub startup_timeout: Duration,
}

impl From<&GlobalConfig> for SessionConfig {
    fn from(config: &GlobalConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            quiescence: config.quiescence(),
            startup_timeout: config.startup_timeout(),
        }
    }
}

/// How a session's program terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitState {
    /// Exited with a success status.
    Clean,
    /// Exited with a failure status, by signal, or could not be waited on.
    Failed(String),
    /// Killed by [`ProcessSession::close`].
    Killed,
}

impl ExitState {
    fn from_wait(result: io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) if status.success() => Self::Clean,
            Ok(status) => Self::Failed(status.code().map_or_else(
                || "process terminated by signal".to_owned(),
                |code| format!("process exited with code {code}"),
            )),
            Err(err) => Self::Failed(format!("wait error: {err}")),
        }
    }

    /// Map the exit onto the error returned to `execute` callers.
    #[must_use]
    pub fn into_error(self) -> AppError {
        match self {
            Self::Clean => AppError::CleanExit,
            Self::Failed(reason) => AppError::Execution(reason),
            Self::Killed => AppError::Execution("session closed".into()),
        }
    }
}

#[derive(Debug)]
struct SessionIo {
    stdin: ChildStdin,
    turns: Turns,
}

/// A running interactive program with quiescence-framed output.
#[derive(Debug)]
pub struct ProcessSession {
    session_id: String,
    pid: Option<u32>,
    io: Mutex<SessionIo>,
    exit_rx: watch::Receiver<Option<ExitState>>,
    kill: CancellationToken,
}

impl ProcessSession {
    /// Spawn the program and wait for its banner.
    ///
    /// Returns the session together with the first turn the program printed.
    ///
    /// # Errors
    ///
    /// - `AppError::Spawn("failed to spawn …")`: OS spawn failure.
    /// - `AppError::Spawn("failed to capture …")`: a pipe could not be attached.
    /// - `AppError::Spawn("program exited before producing output …")`.
    /// - `AppError::Spawn("program produced no output within …")`: startup
    ///   timeout; the child is killed.
    pub async fn start(config: &SessionConfig) -> Result<(Self, String)> {
        let session_id = uuid::Uuid::new_v4().to_string();

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Spawn(format!("failed to spawn {}: {err}", config.executable))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture program stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture program stdout".into()))?;
        let pid = child.id();

        info!(
            session_id,
            pid = pid.unwrap_or(0),
            executable = config.executable,
            "program spawned"
        );

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(
                log_stderr(stderr)
                    .instrument(tracing::debug_span!("stderr", session_id = %session_id)),
            );
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        tokio::spawn(watch_exit(session_id.clone(), child, exit_tx, kill.clone()));

        let mut turns = framer::frame(stdout, config.quiescence);

        let banner = match tokio::time::timeout(config.startup_timeout, turns.next()).await {
            Ok(Some(turn)) => turn,
            Ok(None) => {
                kill.cancel();
                let detail = exit_rx
                    .borrow()
                    .clone()
                    .map_or_else(String::new, |state| format!(" ({state:?})"));
                return Err(AppError::Spawn(format!(
                    "program exited before producing output{detail}"
                )));
            }
            Err(_elapsed) => {
                kill.cancel();
                return Err(AppError::Spawn(format!(
                    "program produced no output within {:?}",
                    config.startup_timeout
                )));
            }
        };

        debug!(session_id, len = banner.len(), "banner received");

        Ok((
            Self {
                session_id,
                pid,
                io: Mutex::new(SessionIo { stdin, turns }),
                exit_rx,
                kill,
            },
            banner,
        ))
    }

    /// Send one command line and wait for the program's response turn.
    ///
    /// Calls are serialized on an internal lock; at most one command is in
    /// flight per session.
    ///
    /// # Errors
    ///
    /// - [`AppError::CleanExit`]: the program exited with a success status.
    /// - [`AppError::Execution`]: the program exited abnormally, was closed,
    ///   or its stdin could not be written.
    pub async fn execute(&self, command: &str) -> Result<String> {
        let mut io = self.io.lock().await;

        if let Some(state) = self.exit_state() {
            return Err(state.into_error());
        }

        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\n');

        if let Err(err) = write_line(&mut io.stdin, &line).await {
            warn!(session_id = self.session_id, %err, "write to program stdin failed");
            // Report the exit instead if it is published shortly.
            let mut exit_rx = self.exit_rx.clone();
            return Err(
                match tokio::time::timeout(EXIT_DRAIN_GRACE, wait_for_exit(&mut exit_rx)).await {
                    Ok(state) => state.into_error(),
                    Err(_elapsed) => AppError::Execution(format!("write failed: {err}")),
                },
            );
        }

        let mut exit_rx = self.exit_rx.clone();

        tokio::select! {
            biased;

            turn = io.turns.next() => match turn {
                Some(turn) => Ok(turn),
                None => Err(wait_for_exit(&mut exit_rx).await.into_error()),
            },

            state = wait_for_exit(&mut exit_rx) => {
                // Deliver the program's parting words; the exit is reported
                // on the next call.
                match tokio::time::timeout(EXIT_DRAIN_GRACE, io.turns.next()).await {
                    Ok(Some(turn)) => Ok(turn),
                    _ => Err(state.into_error()),
                }
            }
        }
    }

    /// Kill the program if it is still running.
    ///
    /// Idempotent: closing an exited or already-closed session does nothing.
    pub async fn close(&self) {
        if !self.is_alive() {
            debug!(session_id = self.session_id, "close: program not running");
            return;
        }

        info!(session_id = self.session_id, "closing session");
        self.kill.cancel();

        let mut exit_rx = self.exit_rx.clone();
        if tokio::time::timeout(CLOSE_TIMEOUT, wait_for_exit(&mut exit_rx))
            .await
            .is_err()
        {
            warn!(
                session_id = self.session_id,
                "program did not confirm exit after kill"
            );
        }
    }

    /// `true` while the program has neither exited nor been asked to die.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        if self.exit_rx.borrow().is_some() || self.kill.is_cancelled() {
            return false;
        }
        pid_alive(self.pid)
    }

    /// The observed exit, if any.
    #[must_use]
    pub fn exit_state(&self) -> Option<ExitState> {
        self.exit_rx.borrow().clone()
    }

    /// OS process id, when the platform reported one.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Identifier used in log fields.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<ExitState>>) -> ExitState {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(state) => state
            .clone()
            .unwrap_or_else(|| ExitState::Failed("exit state missing".into())),
        Err(_) => ExitState::Failed("exit watcher stopped".into()),
    }
}

/// Own the child until it terminates, then publish how it ended.
async fn watch_exit(
    session_id: String,
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitState>>,
    kill: CancellationToken,
) {
    let state = tokio::select! {
        result = child.wait() => ExitState::from_wait(result),
        () = kill.cancelled() => {
            if let Err(err) = child.kill().await {
                warn!(session_id, %err, "failed to kill program");
            }
            ExitState::Killed
        }
    };

    info!(session_id, ?state, "program exited");
    exit_tx.send_replace(Some(state));
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_STDERR_LINE));
    // After a decode error `FramedRead` yields one `None` before resuming.
    let mut resuming = false;
    loop {
        match lines.next().await {
            Some(Ok(line)) => debug!(line, "program stderr"),
            // The codec discards the rest of the line; keep draining.
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!(max = MAX_STDERR_LINE, "program stderr line too long, skipped");
                resuming = true;
                continue;
            }
            Some(Err(LinesCodecError::Io(err))) => {
                debug!(%err, "program stderr unreadable, stopping");
                break;
            }
            None if resuming => {}
            None => break,
        }
        resuming = false;
    }
}

/// Zero-effect liveness check (signal 0).
#[cfg(unix)]
fn pid_alive(pid: Option<u32>) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    kill(Pid::from_raw(raw), None).is_ok()
}

#[cfg(not(unix))]
fn pid_alive(pid: Option<u32>) -> bool {
    pid.is_some()
}
