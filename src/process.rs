//! Spawning and supervising compiler and program subprocesses.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::Signal;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::Limits;
use crate::error::PipelineError;
use crate::terminate::{terminate, ProcessGroup};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Why a subprocess was stopped before it exited on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Killed,
    Timeout,
}

/// Sending half of a run's stop request. Requests after the first are no-ops.
#[derive(Debug)]
pub struct StopHandle(watch::Sender<Option<StopReason>>);

/// Receiving half, polled by the pipeline while it waits on a subprocess.
#[derive(Debug, Clone)]
pub struct StopListener(watch::Receiver<Option<StopReason>>);

pub fn stop_channel() -> (StopHandle, StopListener) {
    let (tx, rx) = watch::channel(None);
    (StopHandle(tx), StopListener(rx))
}

impl StopHandle {
    /// Returns `true` if this call issued the request.
    pub fn request(&self, reason: StopReason) -> bool {
        self.0.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }
}

impl StopListener {
    pub fn current(&self) -> Option<StopReason> {
        *self.0.borrow()
    }

    /// Resolves once a stop is requested. A dropped [`StopHandle`] counts as
    /// a kill: nobody is left to own the run.
    pub async fn requested(&mut self) -> StopReason {
        loop {
            if let Some(reason) = *self.0.borrow_and_update() {
                return reason;
            }
            if self.0.changed().await.is_err() {
                return self.current().unwrap_or(StopReason::Killed);
            }
        }
    }
}

/// How a supervised subprocess ended.
#[derive(Debug, Clone, Copy)]
pub struct Termination {
    pub status: ExitStatus,
    pub stopped: Option<StopReason>,
    pub elapsed: Duration,
}

/// A live subprocess leading its own process group.
#[derive(Debug)]
pub struct RunHandle {
    child: Child,
    group: ProcessGroup,
    pub program: String,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    pub started_at: Instant,
}

impl RunHandle {
    pub fn pid(&self) -> i32 {
        self.group.id()
    }

    pub fn group(&self) -> ProcessGroup {
        self.group
    }

    /// Wait for exit, a stop request or the wall-clock `limit`, whichever
    /// comes first. The leader is always reaped before this returns.
    pub async fn supervise(
        &mut self,
        limit: Duration,
        stop: &mut StopListener,
        grace: Duration,
    ) -> io::Result<Termination> {
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        let reason = tokio::select! {
            status = self.child.wait() => {
                let status = status?;
                self.group.kill_stragglers();
                return Ok(Termination {
                    status,
                    stopped: None,
                    elapsed: self.started_at.elapsed(),
                });
            }
            _ = &mut deadline => StopReason::Timeout,
            reason = stop.requested() => reason,
        };

        info!(pid = self.pid(), program = %self.program, ?reason, "Stopping process group");
        let status = terminate(&mut self.child, self.group, grace).await?;
        Ok(Termination {
            status,
            stopped: Some(reason),
            elapsed: self.started_at.elapsed(),
        })
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        // Abandoned before it was reaped: take the whole group down, not just
        // the leader that `kill_on_drop` covers.
        if let Ok(None) = self.child.try_wait() {
            let _ = self.group.signal(Signal::SIGKILL);
        }
    }
}

/// Spawn `command` in `cwd` as a new process-group leader with `limits`
/// applied between fork and exec. Stdout and stderr are always piped.
pub fn spawn_in_group(
    command: &[String],
    cwd: &Path,
    limits: &Limits,
    pipe_stdin: bool,
) -> Result<RunHandle, PipelineError> {
    let (program, args) = command.split_first().ok_or_else(|| {
        PipelineError::spawn(
            "<empty>",
            io::Error::new(io::ErrorKind::InvalidInput, "command args are empty"),
        )
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .env("HOME", cwd)
        .env("LANG", "C.UTF-8")
        .stdin(if pipe_stdin { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(home) = std::env::var_os("JAVA_HOME") {
        cmd.env("JAVA_HOME", home);
    }

    let limits = limits.clone();
    // SAFETY: the hook only issues setrlimit/prctl syscalls, which are
    // async-signal-safe, and allocates nothing.
    unsafe {
        cmd.pre_exec(move || {
            set_resource_limits(&limits)?;
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| PipelineError::spawn(program.clone(), e))?;
    let group = ProcessGroup::of(&child).ok_or_else(|| {
        PipelineError::spawn(program.clone(), io::Error::other("process exited before it could be tracked"))
    })?;
    debug!(pid = group.id(), program = %program, cwd = %cwd.display(), "Spawned process group");

    Ok(RunHandle {
        stdin: child.stdin.take(),
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
        child,
        group,
        program: program.clone(),
        started_at: Instant::now(),
    })
}

fn set_resource_limits(limits: &Limits) -> io::Result<()> {
    if let Some(cpu) = limits.cpu_secs {
        lower_limit(Resource::RLIMIT_CPU, cpu)?;
    }
    if let Some(kb) = limits.file_size_kb {
        lower_limit(Resource::RLIMIT_FSIZE, kb * 1024)?;
    }
    if let Some(n) = limits.open_files {
        lower_limit(Resource::RLIMIT_NOFILE, n)?;
    }
    if let Some(n) = limits.processes {
        lower_limit(Resource::RLIMIT_NPROC, n)?;
    }
    lower_limit(Resource::RLIMIT_CORE, 0)?;
    Ok(())
}

/// Set soft and hard limits to `value`, never above the inherited hard limit
/// (raising it needs privileges we do not have).
fn lower_limit(resource: Resource, value: u64) -> io::Result<()> {
    let (_, hard) = getrlimit(resource)?;
    let value = value.min(hard);
    setrlimit(resource, value, value)?;
    Ok(())
}

/// Exit code reported to clients: the process's own code, `128 + signal`
/// for signal deaths, `124` for timeouts.
pub fn exit_code(termination: &Termination) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    if termination.stopped == Some(StopReason::Timeout) {
        return 124;
    }
    termination
        .status
        .code()
        .or_else(|| termination.status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}
