//! The run pipeline: materialize, compile, execute, relay, report.
//!
//! One pipeline serves both transports. The streaming transport spawns it on
//! a session task and forwards events to a websocket; the buffered transport
//! drives it inline and folds the events into a [`BatchOutcome`].

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::annotate::{self, AnnotationRequest, ErrorAnnotator, Review};
use crate::compiler::{compile, CompileOptions, CompileReport};
use crate::config::ServiceConfig;
use crate::error::{PipelineError, SessionError};
use crate::event::{Emitter, ExitReason, SessionEvent, StreamKind};
use crate::process::{exit_code, spawn_in_group, StopListener, StopReason};
use crate::relay::Relay;
use crate::session::{RunTicket, Session, SessionState, StdinChunk};
use crate::workspace::{Materializer, Workspace};

/// Exit code for runs stopped before a program was started.
const KILLED_EXIT_CODE: i32 = 128 + libc::SIGTERM;
const TIMEOUT_EXIT_CODE: i32 = 124;
const COMPILE_FAILED_EXIT_CODE: i32 = 1;

const MSG_COMPILING: &str = "⚙  Compiling...";
const MSG_COMPILED: &str = "✓ Compiled successfully";
const MSG_COMPILE_ERROR: &str = "✗ Compilation Error:";
const TRUNCATION_MARKER: &str = "\n... output truncated ...\n";

/// Identifiers whose presence suggests a program reads standard input.
const INPUT_KEYWORDS: &[&str] = &[
    "Scanner",
    "System.in",
    "BufferedReader",
    "InputStreamReader",
    "nextInt",
    "nextLine",
    "nextDouble",
    "nextFloat",
    "readLine",
];

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub source: String,
    /// Written to the program's stdin ahead of any live input.
    pub stdin: Option<String>,
    /// Close stdin after the initial payload (buffered transport).
    pub close_stdin: bool,
}

/// Pipeline stage a run ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compile,
    Run,
}

/// How a run ended, when it got far enough to have an exit.
#[derive(Debug, Clone, Copy)]
struct RunEnd {
    code: i32,
    reason: ExitReason,
    stage: Stage,
    needs_input: bool,
}

impl RunEnd {
    fn compile(code: i32, reason: ExitReason) -> Self {
        Self {
            code,
            reason,
            stage: Stage::Compile,
            needs_input: false,
        }
    }

    fn run(code: i32, reason: ExitReason) -> Self {
        Self {
            stage: Stage::Run,
            ..Self::compile(code, reason)
        }
    }
}

/// `30s` for whole seconds, `500ms` otherwise.
pub fn format_limit(limit: Duration) -> String {
    if limit.subsec_millis() == 0 {
        format!("{}s", limit.as_secs())
    } else {
        format!("{}ms", limit.as_millis())
    }
}

/// Compiles and runs submissions under a global concurrency cap.
pub struct Engine {
    config: Arc<ServiceConfig>,
    materializer: Materializer,
    annotator: Arc<dyn ErrorAnnotator>,
    permits: Arc<Semaphore>,
}

impl Engine {
    pub fn new(config: ServiceConfig) -> Self {
        let annotator =
            annotate::from_config(config.annotator_url.as_deref(), config.annotator_timeout);
        Self::with_annotator(config, annotator)
    }

    pub fn with_annotator(config: ServiceConfig, annotator: Arc<dyn ErrorAnnotator>) -> Self {
        Self {
            materializer: Materializer::new(&config.workspace_root),
            permits: Arc::new(Semaphore::new(config.max_concurrent_runs)),
            config: Arc::new(config),
            annotator,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn materializer(&self) -> &Materializer {
        &self.materializer
    }

    /// Pipelines currently holding an execution slot.
    pub fn active_runs(&self) -> usize {
        self.config
            .max_concurrent_runs
            .saturating_sub(self.permits.available_permits())
    }

    /// Create the workspace root and purge leftovers from a previous process.
    pub async fn prepare(&self) -> io::Result<usize> {
        self.materializer.prepare().await
    }

    /// Start a run on `session`, streaming its events into `events`.
    pub fn start_run(
        self: &Arc<Self>,
        session: &Arc<Session>,
        request: RunRequest,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<u64, SessionError> {
        let initial = request.stdin.clone().filter(|s| !s.is_empty());
        let close_stdin = request.close_stdin;
        let engine = self.clone();
        let owner = session.clone();
        let run_id = session.start(move |ticket| async move {
            let emitter = Emitter::new(ticket.run_id, owner.seq_counter(), events);
            let _ = engine.execute(&owner, ticket, &request, emitter).await;
        })?;
        if let Some(data) = initial {
            session.write_stdin(Bytes::from(data))?;
        }
        if close_stdin {
            session.close_stdin(run_id);
        }
        Ok(run_id)
    }

    /// Run one submission to completion and collect its output.
    pub async fn run_batch(
        &self,
        source: &str,
        stdin: Option<&str>,
    ) -> Result<BatchOutcome, PipelineError> {
        if source.trim().is_empty() {
            return Err(PipelineError::EmptySource);
        }
        let stdin_bytes = stdin.map_or(0, str::len).max(1);
        let session = Session::new(format!("batch-{}", uuid::Uuid::new_v4()), 1)
            .with_stdin_bytes(stdin_bytes);
        let ticket = session.admit()?;
        if let Some(data) = stdin.filter(|s| !s.is_empty()) {
            session.write_stdin(Bytes::from(data.to_string()))?;
        }
        session.close_stdin(ticket.run_id);

        let request = RunRequest {
            source: source.to_string(),
            stdin: stdin.map(str::to_string),
            close_stdin: true,
        };
        let (tx, rx) = mpsc::channel(self.config.event_queue_capacity);
        let emitter = Emitter::new(ticket.run_id, session.seq_counter(), tx);
        let (result, collected) = tokio::join!(
            self.execute(&session, ticket, &request, emitter),
            collect(rx, self.config.max_output_bytes),
        );
        let end = result?;

        let mut outcome = collected;
        // The program ran to its own end; a non-zero exit is reported
        // through `exit_code` and `error`, not as a failed submission.
        outcome.success = matches!(end.reason, ExitReason::Normal | ExitReason::RuntimeError);
        outcome.exit_code = end.code;
        outcome.reason = end.reason;
        outcome.stage = end.stage;
        outcome.timeout_limit = match end.stage {
            Stage::Compile => self.config.compile_timeout,
            Stage::Run => self.config.run_timeout,
        };
        outcome.needs_input = end.needs_input;
        Ok(outcome)
    }

    /// Drive one admitted run and report its end on the event queue. The
    /// session leaves compiling/running before the final event is sent.
    async fn execute(
        &self,
        session: &Session,
        ticket: RunTicket,
        request: &RunRequest,
        emitter: Emitter,
    ) -> Result<RunEnd, PipelineError> {
        let RunTicket {
            run_id,
            mut stop,
            stdin,
            previous,
        } = ticket;
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        let started = Instant::now();
        let result = self
            .drive(session, run_id, request, &mut stop, stdin, &emitter)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(end) => {
                session.finish(run_id, SessionState::Exited);
                info!(
                    session = %session.id(),
                    run_id,
                    code = end.code,
                    reason = ?end.reason,
                    elapsed_ms,
                    "Run finished"
                );
                emitter
                    .exit(end.code, end.reason, end.needs_input, elapsed_ms)
                    .await;
            }
            Err(e) => {
                session.finish(run_id, SessionState::Error);
                match e {
                    PipelineError::EmptySource | PipelineError::Busy(_) => {
                        debug!(session = %session.id(), run_id, error = %e, "Run rejected")
                    }
                    _ => warn!(session = %session.id(), run_id, error = %e, "Run failed"),
                }
                emitter.error(e.to_string()).await;
            }
        }
        result
    }

    async fn drive(
        &self,
        session: &Session,
        run_id: u64,
        request: &RunRequest,
        stop: &mut StopListener,
        stdin: mpsc::Receiver<StdinChunk>,
        emitter: &Emitter,
    ) -> Result<RunEnd, PipelineError> {
        let config = &self.config;
        if request.source.trim().is_empty() {
            return Err(PipelineError::EmptySource);
        }
        let _permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| PipelineError::Busy(config.max_concurrent_runs))?;

        emitter.system(MSG_COMPILING).await;
        let workspace = self
            .materializer
            .materialize(session.id(), run_id, &request.source)
            .await?;
        if stop.current().is_some() {
            workspace.remove().await;
            return Ok(RunEnd::compile(KILLED_EXIT_CODE, ExitReason::Killed));
        }

        let options = CompileOptions {
            toolchain: &config.toolchain,
            limits: &config.compile_limits,
            timeout: config.compile_timeout,
            grace: config.kill_grace,
            max_output_bytes: config.max_diagnostic_bytes,
        };
        let report = match compile(&workspace, options, stop).await {
            Ok(report) => report,
            Err(PipelineError::CompileTimeout(limit)) => {
                emitter
                    .system(format!("⏱ Compilation timed out ({} limit)", format_limit(limit)))
                    .await;
                workspace.remove().await;
                return Ok(RunEnd::compile(TIMEOUT_EXIT_CODE, ExitReason::Timeout));
            }
            Err(PipelineError::Stopped) => {
                workspace.remove().await;
                return Ok(RunEnd::compile(KILLED_EXIT_CODE, ExitReason::Killed));
            }
            Err(e) => return Err(e),
        };
        if !report.success {
            self.report_compile_failure(report, &request.source, emitter).await;
            workspace.remove().await;
            return Ok(RunEnd::compile(COMPILE_FAILED_EXIT_CODE, ExitReason::CompilationError));
        }
        emitter.system(MSG_COMPILED).await;

        let end = self
            .run_program(session, run_id, request, &workspace, stop, stdin, emitter)
            .await;
        workspace.remove().await;
        end
    }

    async fn report_compile_failure(&self, report: CompileReport, source: &str, emitter: &Emitter) {
        debug!(errors = report.errors.len(), "Compilation failed");
        let text = if report.diagnostics.trim().is_empty() {
            "Compilation failed".to_string()
        } else {
            report.diagnostics.clone()
        };
        emitter.system(MSG_COMPILE_ERROR).await;
        emitter.diagnostics(report).await;
        let review = self
            .annotator
            .annotate(AnnotationRequest {
                error: &text,
                source,
                is_compilation_error: true,
            })
            .await;
        if let Some(review) = review {
            emitter.review(review).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_program(
        &self,
        session: &Session,
        run_id: u64,
        request: &RunRequest,
        workspace: &Workspace,
        stop: &mut StopListener,
        stdin: mpsc::Receiver<StdinChunk>,
        emitter: &Emitter,
    ) -> Result<RunEnd, PipelineError> {
        let config = &self.config;
        let command = config.toolchain.run_command(workspace);
        let mut handle = spawn_in_group(&command, &workspace.root, &config.run_limits, true)?;
        session.mark_running(run_id);
        debug!(session = %session.id(), run_id, pid = handle.pid(), "Program started");

        let relay = Relay::start(&mut handle, emitter, stdin);
        let termination = handle
            .supervise(config.run_timeout, stop, config.kill_grace)
            .await?;
        let drained = relay.drain(config.drain_timeout).await;
        drop(handle);

        let code = exit_code(&termination);
        let reason = match termination.stopped {
            Some(StopReason::Timeout) => ExitReason::Timeout,
            Some(StopReason::Killed) => ExitReason::Killed,
            None if code == 0 => ExitReason::Normal,
            None => ExitReason::RuntimeError,
        };

        let mut end = RunEnd::run(code, reason);
        match reason {
            ExitReason::Timeout => {
                end.needs_input = request.close_stdin
                    && request.stdin.as_deref().map_or(true, str::is_empty)
                    && reads_stdin(&request.source);
                emitter
                    .system(format!(
                        "⏱ Execution timeout ({} limit)",
                        format_limit(config.run_timeout)
                    ))
                    .await;
            }
            ExitReason::RuntimeError => {
                let tail = if drained.stderr_tail.is_empty() {
                    &drained.stdout_tail
                } else {
                    &drained.stderr_tail
                };
                let text = String::from_utf8_lossy(tail);
                let review = self
                    .annotator
                    .annotate(AnnotationRequest {
                        error: &text,
                        source: &request.source,
                        is_compilation_error: false,
                    })
                    .await;
                if let Some(review) = review {
                    emitter.review(review).await;
                }
            }
            _ => {}
        }
        Ok(end)
    }
}

/// True when `source` mentions any of the usual stdin readers.
pub fn reads_stdin(source: &str) -> bool {
    INPUT_KEYWORDS.iter().any(|keyword| source.contains(keyword))
}

/// Everything the buffered transport reports about one run.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// The program was compiled and ran to its own exit, zero or not.
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub reason: ExitReason,
    pub stage: Stage,
    /// Wall-clock limit of `stage`.
    pub timeout_limit: Duration,
    /// Compiler output when compilation failed.
    pub diagnostics: Option<CompileReport>,
    pub review: Option<Review>,
    pub needs_input: bool,
    pub truncated: bool,
}

impl BatchOutcome {
    /// User-facing error text: diagnostics, stderr, and a note on timeouts.
    pub fn error_text(&self) -> String {
        match self.reason {
            ExitReason::CompilationError => self
                .diagnostics
                .as_ref()
                .map(|d| d.diagnostics.clone())
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| "Compilation failed".to_string()),
            ExitReason::Timeout if self.needs_input => "Program is waiting for input. \
                 Enter the input it expects in the stdin field and run again."
                .to_string(),
            ExitReason::Timeout if self.stage == Stage::Compile => {
                format!("Compilation timed out ({} limit)", format_limit(self.timeout_limit))
            }
            ExitReason::Timeout => {
                let mut text = self.stderr.clone();
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&format!(
                    "Execution timeout ({} limit)",
                    format_limit(self.timeout_limit)
                ));
                text
            }
            _ => self.stderr.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Capped {
    buf: Vec<u8>,
    truncated: bool,
}

impl Capped {
    fn push(&mut self, data: &[u8], cap: usize) {
        let room = cap.saturating_sub(self.buf.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&data[..data.len().min(room)]);
    }

    fn finish(self) -> String {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

async fn collect(mut rx: mpsc::Receiver<SessionEvent>, cap: usize) -> BatchOutcome {
    let mut stdout = Capped::default();
    let mut stderr = Capped::default();
    let mut diagnostics = None;
    let mut review = None;
    while let Some(event) = rx.recv().await {
        match event {
            SessionEvent::Output(chunk) => match chunk.stream {
                StreamKind::Stdout => stdout.push(&chunk.data, cap),
                StreamKind::Stderr => stderr.push(&chunk.data, cap),
                StreamKind::System => {}
            },
            SessionEvent::Diagnostics { report, .. } => diagnostics = Some(report),
            SessionEvent::Review { review: r, .. } => review = Some(r),
            SessionEvent::Exit(_) | SessionEvent::Error { .. } => {}
        }
    }
    let truncated = stdout.truncated || stderr.truncated;
    BatchOutcome {
        success: false,
        stdout: stdout.finish(),
        stderr: stderr.finish(),
        exit_code: -1,
        reason: ExitReason::RuntimeError,
        stage: Stage::Run,
        timeout_limit: Duration::ZERO,
        diagnostics,
        review,
        needs_input: false,
        truncated,
    }
}
