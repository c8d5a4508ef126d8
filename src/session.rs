//! Per-connection session state machine.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::SessionError;
use crate::process::{stop_channel, StopHandle, StopListener, StopReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Compiling,
    Running,
    Exited,
    Error,
}

impl SessionState {
    /// A run owns the session in these states.
    pub fn is_busy(self) -> bool {
        matches!(self, SessionState::Compiling | SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Compiling => "compiling",
            SessionState::Running => "running",
            SessionState::Exited => "exited",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Bytes of queued stdin a run may hold unless configured otherwise.
pub const DEFAULT_STDIN_BYTES: usize = 1024 * 1024;

/// One queued write to a program's stdin. Holds its share of the run's byte
/// budget until it is dropped.
#[derive(Debug)]
pub struct StdinChunk {
    pub data: Bytes,
    _budget: OwnedSemaphorePermit,
}

/// Everything a run pipeline receives when it is admitted.
#[derive(Debug)]
pub struct RunTicket {
    pub run_id: u64,
    pub stop: StopListener,
    pub stdin: mpsc::Receiver<StdinChunk>,
    /// Task of the previous run; awaited before anything is spawned so the
    /// old process is reaped and its events are out first.
    pub previous: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct ActiveRun {
    run_id: u64,
    stop: StopHandle,
    stdin: Option<mpsc::Sender<StdinChunk>>,
    stdin_budget: Arc<Semaphore>,
}

#[derive(Debug)]
struct Inner {
    active: Option<ActiveRun>,
    /// Most recently spawned run task, finished or not.
    task: Option<JoinHandle<()>>,
    closed: bool,
}

/// One connection's session. At most one run is active at a time.
#[derive(Debug)]
pub struct Session {
    id: String,
    seq: Arc<AtomicU64>,
    next_run: AtomicU64,
    stdin_capacity: usize,
    stdin_bytes: usize,
    state: watch::Sender<SessionState>,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(id: impl Into<String>, stdin_capacity: usize) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            id: id.into(),
            seq: Arc::new(AtomicU64::new(0)),
            next_run: AtomicU64::new(1),
            stdin_capacity: stdin_capacity.max(1),
            stdin_bytes: DEFAULT_STDIN_BYTES,
            state,
            inner: Mutex::new(Inner {
                active: None,
                task: None,
                closed: false,
            }),
        }
    }

    /// Cap the bytes of stdin queued for a run that has not consumed them yet.
    pub fn with_stdin_bytes(mut self, bytes: usize) -> Self {
        self.stdin_bytes = bytes.clamp(1, Semaphore::MAX_PERMITS);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Session-wide sequence counter shared by every run's emitter.
    pub fn seq_counter(&self) -> Arc<AtomicU64> {
        self.seq.clone()
    }

    pub fn active_run_id(&self) -> Option<u64> {
        self.lock().active.as_ref().map(|run| run.run_id)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked: every update is a
        // single assignment.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a new run and spawn its pipeline. `pipeline` is called with the
    /// run's ticket while the session is locked, so the run is registered
    /// before any other operation can observe the session.
    pub fn start<F, Fut>(&self, pipeline: F) -> Result<u64, SessionError>
    where
        F: FnOnce(RunTicket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        let ticket = self.admit_locked(&mut inner)?;
        let run_id = ticket.run_id;
        inner.task = Some(tokio::spawn(pipeline(ticket)));
        Ok(run_id)
    }

    /// Admit a new run that the caller drives on its own task.
    pub fn admit(&self) -> Result<RunTicket, SessionError> {
        let mut inner = self.lock();
        self.admit_locked(&mut inner)
    }

    fn admit_locked(&self, inner: &mut Inner) -> Result<RunTicket, SessionError> {
        if inner.closed {
            return Err(SessionError::Closed);
        }
        let state = self.state();
        if state.is_busy() {
            return Err(SessionError::InvalidState { op: "run", state });
        }

        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let (stop, listener) = stop_channel();
        let (stdin_tx, stdin_rx) = mpsc::channel(self.stdin_capacity);
        inner.active = Some(ActiveRun {
            run_id,
            stop,
            stdin: Some(stdin_tx),
            stdin_budget: Arc::new(Semaphore::new(self.stdin_bytes)),
        });
        // exited/error -> idle -> compiling
        self.state.send_replace(SessionState::Idle);
        self.state.send_replace(SessionState::Compiling);
        debug!(session = %self.id, run_id, "Run admitted");
        Ok(RunTicket {
            run_id,
            stop: listener,
            stdin: stdin_rx,
            previous: inner.task.take(),
        })
    }

    /// Compiling -> running. Returns `false` if `run_id` is no longer active.
    pub fn mark_running(&self, run_id: u64) -> bool {
        let inner = self.lock();
        match &inner.active {
            Some(run) if run.run_id == run_id && self.state() == SessionState::Compiling => {
                self.state.send_replace(SessionState::Running);
                true
            }
            _ => false,
        }
    }

    /// End `run_id` in `state` (exited or error). Releases its stdin queue.
    pub fn finish(&self, run_id: u64, state: SessionState) {
        debug_assert!(matches!(state, SessionState::Exited | SessionState::Error));
        let mut inner = self.lock();
        if inner.active.as_ref().map(|run| run.run_id) != Some(run_id) {
            return;
        }
        inner.active = None;
        self.state.send_replace(state);
        debug!(session = %self.id, run_id, %state, "Run finished");
    }

    /// Request termination of the active run. `Ok(false)` when nothing was
    /// left to stop or a stop was already requested.
    pub fn kill(&self) -> Result<bool, SessionError> {
        let inner = self.lock();
        let state = self.state();
        match state {
            SessionState::Idle => Err(SessionError::InvalidState { op: "kill", state }),
            SessionState::Compiling | SessionState::Running => Ok(inner
                .active
                .as_ref()
                .is_some_and(|run| run.stop.request(StopReason::Killed))),
            SessionState::Exited | SessionState::Error => Ok(false),
        }
    }

    /// Queue stdin for the active run. Input arriving while compiling is
    /// delivered once the program starts; input with no run is ignored
    /// (`Ok(false)`). Both the number of queued chunks and their total size
    /// are bounded; past either bound the input is rejected with `StdinFull`.
    pub fn write_stdin(&self, data: Bytes) -> Result<bool, SessionError> {
        let inner = self.lock();
        if !self.state().is_busy() {
            return Ok(false);
        }
        let Some((tx, budget)) = inner
            .active
            .as_ref()
            .and_then(|run| run.stdin.as_ref().map(|tx| (tx, &run.stdin_budget)))
        else {
            return Ok(false);
        };
        let bytes = u32::try_from(data.len()).map_err(|_| SessionError::StdinFull)?;
        let permit = budget
            .clone()
            .try_acquire_many_owned(bytes)
            .map_err(|_| SessionError::StdinFull)?;
        let chunk = StdinChunk {
            data,
            _budget: permit,
        };
        match tx.try_send(chunk) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SessionError::StdinFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(false),
        }
    }

    /// Close the active run's stdin once queued input is written.
    pub fn close_stdin(&self, run_id: u64) {
        let mut inner = self.lock();
        if let Some(run) = inner.active.as_mut().filter(|run| run.run_id == run_id) {
            run.stdin = None;
        }
    }

    /// Resolves once no run owns the session.
    pub async fn settled(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|state| !state.is_busy()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        settled
    }

    /// Refuse further runs and stop the active one. Reaping finishes in the
    /// run's own task.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        if let Some(run) = inner.active.as_ref() {
            run.stop.request(StopReason::Killed);
        }
        debug!(session = %self.id, "Session closed");
    }

    /// Wait for the most recent run task to complete.
    pub async fn join(&self) {
        let task = self.lock().task.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
