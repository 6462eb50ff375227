//! Child process supervisor.
//!
//! Owns the one live child (or attached transport) per bridge:
//! - spawns it with piped stdio and `kill_on_drop(true)`, so every exit path
//!   releases the process,
//! - runs the stdout read loop and the stderr drain on their own tasks,
//! - serializes writes to stdin behind a single lock,
//! - stops it with a polite `stop` record, then SIGTERM, then a kill once
//!   the termination timeout elapses.
//!
//! # States
//!
//! `Stopped → Starting → Running → Stopping → Stopped`, plus
//! `Running → Stopped` through [`ProcessSupervisor::mark_exited`] when the
//! read loop reports that the child's output closed.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::codec::LineCodec;
use crate::bridge::protocol::OutboundCommand;
use crate::bridge::reader::{run_reader, run_stderr_logger, StreamEvent};
use crate::config::BridgeConfig;
use crate::{AppError, Result};

/// How long background tasks of a child that exited on its own get to finish
/// before they are aborted.
const TASK_JOIN_GRACE: Duration = Duration::from_millis(250);

/// How long a child whose output closed gets to exit before it is killed.
const REAP_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle state of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No child.
    Stopped,
    /// Spawn in progress.
    Starting,
    /// Child live; reads and writes flowing.
    Running,
    /// Shutdown in progress.
    Stopping,
}

/// Program and arguments used to launch the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable to run.
    pub program: PathBuf,
    /// Positional arguments.
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// Derive the launch command from configuration.
    ///
    /// With an interpreter: `interpreter client_path token`. Without one:
    /// `client_path token`. There is no fallback between the two.
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        if config.interpreter.is_empty() {
            Self {
                program: config.client_path.clone(),
                args: vec![config.token.clone()],
            }
        } else {
            Self {
                program: PathBuf::from(&config.interpreter),
                args: vec![
                    config.client_path.to_string_lossy().into_owned(),
                    config.token.clone(),
                ],
            }
        }
    }
}

type StdinWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything owned on behalf of one live child.
struct Live {
    session_id: String,
    child: Option<Child>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Supervisor for the bridge's child process.
pub struct ProcessSupervisor {
    state: watch::Sender<ProcessState>,
    stdin: Mutex<Option<StdinWriter>>,
    live: Mutex<Option<Live>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    /// Create a supervisor in the `Stopped` state.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(ProcessState::Stopped);
        Self {
            state,
            stdin: Mutex::new(None),
            live: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Tracing id of the live child, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.live.lock().await.as_ref().map(|l| l.session_id.clone())
    }

    /// OS process id of the live child, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.live
            .lock()
            .await
            .as_ref()
            .and_then(|l| l.child.as_ref())
            .and_then(Child::id)
    }

    /// Whether a child is live and has not exited.
    ///
    /// Polls the process, so an exit is noticed even before the read loop
    /// reports the closed stream.
    pub async fn is_running(&self) -> bool {
        if self.state() != ProcessState::Running {
            return false;
        }
        let mut live = self.live.lock().await;
        match live.as_mut() {
            None => false,
            Some(Live { child: None, .. }) => true,
            Some(Live {
                child: Some(child), ..
            }) => matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Spawn the child and start its read loop.
    ///
    /// Decoded records and the final `Closed` are delivered through `events`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if a child is already live, the executable
    /// cannot be launched, or its stdio cannot be captured. The supervisor is
    /// `Stopped` afterwards.
    pub async fn start(&self, launch: &LaunchSpec, events: mpsc::Sender<StreamEvent>) -> Result<()> {
        let mut live = self.live.lock().await;
        self.ensure_idle(live.is_some())?;
        self.state.send_replace(ProcessState::Starting);

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.state.send_replace(ProcessState::Stopped);
                error!(program = %launch.program.display(), %err, "failed to launch child process");
                return Err(AppError::Spawn(format!(
                    "failed to launch {}: {err}",
                    launch.program.display()
                )));
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            // kill_on_drop reaps the half-built child.
            self.state.send_replace(ProcessState::Stopped);
            return Err(AppError::Spawn("failed to capture child stdio".into()));
        };
        let stderr = child.stderr.take();

        let session_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let mut tasks = vec![spawn_reader(
            session_id.clone(),
            stdout,
            events,
            cancel.clone(),
        )];
        if let Some(stderr) = stderr {
            let sid = session_id.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(run_stderr_logger(sid, stderr, token)));
        }

        info!(
            session_id,
            pid = child.id(),
            program = %launch.program.display(),
            "child process started"
        );

        *self.stdin.lock().await = Some(Box::new(stdin));
        *live = Some(Live {
            session_id,
            child: Some(child),
            cancel,
            tasks,
        });
        self.state.send_replace(ProcessState::Running);
        Ok(())
    }

    /// Drive the bridge over an already-connected stream pair instead of a
    /// spawned child.
    ///
    /// Stopping closes `stdin` and ends the read loop; there is no process to
    /// signal.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if a child or transport is already live.
    pub async fn attach<R, W>(
        &self,
        stdout: R,
        stdin: W,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut live = self.live.lock().await;
        self.ensure_idle(live.is_some())?;

        let session_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let reader = spawn_reader(session_id.clone(), stdout, events, cancel.clone());
        debug!(session_id, "transport attached");

        *self.stdin.lock().await = Some(Box::new(stdin));
        *live = Some(Live {
            session_id,
            child: None,
            cancel,
            tasks: vec![reader],
        });
        self.state.send_replace(ProcessState::Running);
        Ok(())
    }

    /// Write one command record to the child's stdin.
    ///
    /// Concurrent callers are serialized; records never interleave.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Write`] if no child is live, stdin is closed, or
    /// the write fails. The supervisor stays usable either way.
    pub async fn write(&self, command: &OutboundCommand) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(AppError::Write("child stdin is closed".into()));
        };
        write_command(stdin, command).await
    }

    /// Reap a child whose output stream closed on its own.
    ///
    /// Returns a description of how the child ended, or `None` if the child
    /// was not `Running` (already stopped, or a `stop` is in progress).
    pub async fn mark_exited(&self) -> Option<String> {
        let taken = {
            let mut live = self.live.lock().await;
            if self.state() != ProcessState::Running {
                return None;
            }
            let taken = live.take()?;
            self.state.send_replace(ProcessState::Stopping);
            taken
        };

        taken.cancel.cancel();
        self.stdin.lock().await.take();

        let outcome = match taken.child {
            Some(mut child) => match tokio::time::timeout(REAP_GRACE, child.wait()).await {
                Ok(Ok(status)) => describe_exit(status),
                Ok(Err(err)) => format!("wait error: {err}"),
                Err(_) => {
                    warn!(
                        session_id = taken.session_id,
                        "child closed its output but kept running, killing"
                    );
                    if let Err(err) = child.kill().await {
                        warn!(session_id = taken.session_id, %err, "failed to kill child");
                    }
                    "output closed; process killed".to_owned()
                }
            },
            None => "transport closed".to_owned(),
        };

        join_tasks(taken.tasks, Instant::now() + TASK_JOIN_GRACE).await;
        self.state.send_replace(ProcessState::Stopped);
        info!(session_id = taken.session_id, outcome, "child process exited");
        Some(outcome)
    }

    /// Stop the child: `stop` record, SIGTERM, wait up to `timeout`, then kill.
    ///
    /// Everything, including joining the read tasks, shares one deadline;
    /// past it the child is killed and the tasks are aborted, so the call
    /// returns about `timeout` after it started at worst.
    ///
    /// Idempotent: stopping a `Stopped` supervisor is a no-op.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok(())`; shutdown failures are logged and
    /// escalated, never returned.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let taken = {
            let mut live = self.live.lock().await;
            let Some(taken) = live.take() else {
                debug!("supervisor: stop requested while stopped");
                return Ok(());
            };
            self.state.send_replace(ProcessState::Stopping);
            taken
        };

        let Live {
            session_id,
            child,
            cancel,
            tasks,
        } = taken;
        let deadline = Instant::now() + timeout;

        cancel.cancel();

        let polite = async {
            if let Some(mut stdin) = self.stdin.lock().await.take() {
                match write_command(&mut stdin, &OutboundCommand::Stop).await {
                    Ok(()) => debug!(session_id, "stop command sent"),
                    Err(err) => debug!(session_id, %err, "stop command not delivered"),
                }
                if let Err(err) = stdin.shutdown().await {
                    debug!(session_id, %err, "closing child stdin failed");
                }
            }
        };
        if tokio::time::timeout_at(deadline, polite).await.is_err() {
            warn!(session_id, "stdin busy during stop, skipping stop command");
        }

        if let Some(child) = child {
            terminate_child(&session_id, child, deadline).await;
        }

        join_tasks(tasks, deadline).await;
        self.state.send_replace(ProcessState::Stopped);
        info!(session_id, "child process stopped");
        Ok(())
    }

    fn ensure_idle(&self, has_live: bool) -> Result<()> {
        if has_live || self.state() != ProcessState::Stopped {
            return Err(AppError::Spawn("child process already running".into()));
        }
        Ok(())
    }
}

fn spawn_reader<R>(
    session_id: String,
    stdout: R,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = run_reader(session_id.clone(), stdout, events, cancel).await {
            warn!(session_id, %err, "bridge reader ended with error");
        }
    })
}

async fn write_command<W>(stdin: &mut W, command: &OutboundCommand) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    LineCodec::new().encode(command, &mut buf)?;

    stdin
        .write_all(&buf)
        .await
        .map_err(|e| AppError::Write(format!("write failed: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| AppError::Write(format!("flush failed: {e}")))
}

/// Ask the child to exit, escalating to a kill at `deadline`.
async fn terminate_child(session_id: &str, mut child: Child, deadline: Instant) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(raw) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                debug!(session_id, %err, "SIGTERM not delivered");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = child.start_kill() {
            debug!(session_id, %err, "terminate request failed");
        }
    }

    match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => {
            info!(session_id, status = %describe_exit(status), "child process exited");
        }
        Ok(Err(err)) => {
            warn!(session_id, %err, "error waiting for child process");
        }
        Err(_) => {
            warn!(session_id, "child did not exit within timeout, killing");
            if let Err(err) = child.kill().await {
                warn!(session_id, %err, "failed to kill child process");
            }
        }
    }
}

/// Wait for `tasks` until `deadline`, aborting whatever is still running.
pub(crate) async fn join_tasks(tasks: Vec<JoinHandle<()>>, deadline: Instant) {
    for mut task in tasks {
        if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
            task.abort();
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if status.success() {
        "exited normally (code 0)".to_owned()
    } else {
        status.code().map_or_else(
            || "terminated by signal".to_owned(),
            |c| format!("exited with code {c}"),
        )
    }
}
