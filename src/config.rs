//! Service configuration shared by the server, the pipeline and the CLI.

use std::path::PathBuf;
use std::time::Duration;

use crate::toolchain::Toolchain;

/// Per-process resource ceilings applied in the child before exec.
///
/// `None` leaves the inherited limit untouched.
#[derive(Debug, Clone, Default)]
pub struct Limits {
    pub cpu_secs: Option<u64>,
    pub file_size_kb: Option<u64>,
    pub open_files: Option<u64>,
    /// RLIMIT_NPROC. Counted per user and including threads, so it must leave
    /// room for every JVM the service runs at once.
    pub processes: Option<u64>,
}

impl Limits {
    /// Ceilings for `javac`, which shares no user code and so gets no NPROC cap.
    pub fn compiler() -> Self {
        Self {
            cpu_secs: Some(60),
            file_size_kb: Some(16 * 1024),
            open_files: Some(512),
            processes: None,
        }
    }

    /// Ceilings for user programs. Heap is bounded through `-Xmx` instead of
    /// RLIMIT_AS since the JVM reserves far more address space than it uses.
    pub fn program() -> Self {
        Self {
            cpu_secs: Some(120),
            file_size_kb: Some(10 * 1024),
            open_files: Some(512),
            processes: Some(DEFAULT_PROCESS_LIMIT),
        }
    }
}

/// Default RLIMIT_NPROC for user programs. A JVM starts a few dozen threads,
/// and the limit covers all of them across concurrent runs.
pub const DEFAULT_PROCESS_LIMIT: u64 = 4096;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding one `ws-*` workspace per run.
    pub workspace_root: PathBuf,
    pub toolchain: Toolchain,
    pub compile_timeout: Duration,
    pub run_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when stopping a process group.
    pub kill_grace: Duration,
    /// Upper bound on waiting for stdout/stderr EOF after the program exits.
    pub drain_timeout: Duration,
    pub compile_limits: Limits,
    pub run_limits: Limits,
    /// Stdin chunks buffered per run before `terminal:input` is rejected.
    pub stdin_queue_capacity: usize,
    /// Bytes of stdin buffered per run before `terminal:input` is rejected.
    pub stdin_queue_bytes: usize,
    /// Largest websocket frame accepted from a client.
    pub max_message_bytes: usize,
    /// Events buffered per connection (or per batch run) before pumps block.
    pub event_queue_capacity: usize,
    /// Per-stream cap on output collected by the buffered transport.
    pub max_output_bytes: usize,
    pub max_diagnostic_bytes: usize,
    pub max_concurrent_runs: usize,
    pub workspace_max_age: Duration,
    pub sweep_interval: Duration,
    /// Kill the active run when a new `terminal:run` arrives instead of rejecting it.
    pub replace_active_run: bool,
    /// Translate `\n` into `\r\n` on the websocket for xterm-style clients.
    pub terminal_newlines: bool,
    pub annotator_url: Option<String>,
    pub annotator_timeout: Duration,
}

impl ServiceConfig {
    pub fn new(workspace_root: PathBuf, toolchain: Toolchain) -> Self {
        Self {
            workspace_root,
            toolchain,
            compile_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(2),
            compile_limits: Limits::compiler(),
            run_limits: Limits::program(),
            stdin_queue_capacity: 256,
            stdin_queue_bytes: 1024 * 1024,
            max_message_bytes: 2 * 1024 * 1024,
            event_queue_capacity: 256,
            max_output_bytes: 1024 * 1024,
            max_diagnostic_bytes: 64 * 1024,
            max_concurrent_runs: 32,
            workspace_max_age: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
            replace_active_run: true,
            terminal_newlines: true,
            annotator_url: None,
            annotator_timeout: Duration::from_secs(15),
        }
    }
}

/// Default workspace root: `$TMPDIR/javarena`.
pub fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("javarena")
}
