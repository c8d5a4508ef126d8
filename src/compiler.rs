//! The `javac` stage.

use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use crate::config::Limits;
use crate::error::PipelineError;
use crate::process::{exit_code, spawn_in_group, StopListener, StopReason};
use crate::toolchain::Toolchain;
use crate::workspace::Workspace;

const READ_CHUNK_SIZE: usize = 8192;

/// One `File.java:LINE: error: MESSAGE` line from the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub line: u32,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct CompileReport {
    pub success: bool,
    pub exit_code: i32,
    /// Combined compiler output with workspace paths stripped.
    pub diagnostics: String,
    pub errors: Vec<Diagnostic>,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct CompileOptions<'a> {
    pub toolchain: &'a Toolchain,
    pub limits: &'a Limits,
    pub timeout: Duration,
    pub grace: Duration,
    pub max_output_bytes: usize,
}

/// Compile the workspace's single source file.
///
/// A non-zero `javac` exit is a normal result with `success == false`.
/// Hitting `timeout` yields [`PipelineError::CompileTimeout`]; a stop
/// request yields [`PipelineError::Stopped`].
pub async fn compile(
    workspace: &Workspace,
    opts: CompileOptions<'_>,
    stop: &mut StopListener,
) -> Result<CompileReport, PipelineError> {
    let command = opts.toolchain.compile_command(workspace);
    let mut handle = spawn_in_group(&command, &workspace.root, opts.limits, false)?;

    let cap = opts.max_output_bytes;
    let stdout = handle.stdout.take().map(|r| tokio::spawn(read_capped(r, cap)));
    let stderr = handle.stderr.take().map(|r| tokio::spawn(read_capped(r, cap)));

    let termination = handle.supervise(opts.timeout, stop, opts.grace).await?;
    let (out, out_truncated) = join_capture(stdout).await;
    let (err, err_truncated) = join_capture(stderr).await;

    match termination.stopped {
        Some(StopReason::Timeout) => {
            info!(path = %workspace.root.display(), "Compilation timed out");
            return Err(PipelineError::CompileTimeout(opts.timeout));
        }
        Some(StopReason::Killed) => return Err(PipelineError::Stopped),
        None => {}
    }

    let mut text = String::from_utf8_lossy(&out).into_owned();
    text.push_str(&String::from_utf8_lossy(&err));
    let diagnostics = strip_workspace_paths(&text, workspace);
    let code = exit_code(&termination);
    let class_present = tokio::fs::try_exists(workspace.class_path())
        .await
        .unwrap_or(false);

    let report = CompileReport {
        success: code == 0 && class_present,
        exit_code: code,
        errors: parse_diagnostics(&diagnostics),
        diagnostics,
        truncated: out_truncated || err_truncated,
    };
    debug!(
        class = %workspace.class_name,
        success = report.success,
        errors = report.errors.len(),
        elapsed_ms = termination.elapsed.as_millis() as u64,
        "Compilation finished"
    );
    Ok(report)
}

async fn join_capture(
    task: Option<tokio::task::JoinHandle<std::io::Result<(Vec<u8>, bool)>>>,
) -> (Vec<u8>, bool) {
    match task {
        Some(task) => task.await.ok().and_then(Result::ok).unwrap_or_default(),
        None => (Vec::new(), false),
    }
}

/// Read to EOF, keeping at most `cap` bytes. Continue reading past the cap
/// so the writer never blocks on a full pipe.
pub(crate) async fn read_capped<R>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(cap.min(READ_CHUNK_SIZE));
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(buf.len());
        if n > room {
            truncated = true;
        }
        buf.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok((buf, truncated))
}

fn strip_workspace_paths(text: &str, workspace: &Workspace) -> String {
    let mut prefix = workspace.root.to_string_lossy().into_owned();
    prefix.push('/');
    text.replace(&prefix, "")
}

/// Extract `{line, message}` from every `<file>.java:<line>: error: <message>` line.
pub fn parse_diagnostics(text: &str) -> Vec<Diagnostic> {
    text.lines().filter_map(parse_error_line).collect()
}

fn parse_error_line(line: &str) -> Option<Diagnostic> {
    let at = line.find(".java:")?;
    let rest = &line[at + ".java:".len()..];
    let (number, rest) = rest.split_once(':')?;
    let line_no = number.parse().ok()?;
    let message = rest.trim_start().strip_prefix("error:")?.trim();
    Some(Diagnostic {
        line: line_no,
        message: message.to_string(),
    })
}
