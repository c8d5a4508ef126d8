//! Events produced by a run and consumed by a transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::annotate::Review;
use crate::compiler::CompileReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    System,
}

/// One read from a program stream, or one status line from the service.
///
/// `data` never ends in the middle of a UTF-8 sequence unless the program
/// itself wrote invalid UTF-8.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub run_id: u64,
    pub seq: u64,
    pub stream: StreamKind,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Normal,
    Killed,
    Timeout,
    RuntimeError,
    CompilationError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub run_id: u64,
    pub seq: u64,
    pub code: i32,
    pub reason: ExitReason,
    /// The program timed out while apparently waiting for input nobody sent.
    pub needs_input: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Output(OutputChunk),
    Diagnostics {
        run_id: u64,
        seq: u64,
        report: CompileReport,
    },
    Review {
        run_id: u64,
        seq: u64,
        review: Review,
    },
    Exit(ExitReport),
    Error { run_id: Option<u64>, message: String },
}

impl SessionEvent {
    pub fn run_id(&self) -> Option<u64> {
        match self {
            SessionEvent::Output(chunk) => Some(chunk.run_id),
            SessionEvent::Diagnostics { run_id, .. } | SessionEvent::Review { run_id, .. } => Some(*run_id),
            SessionEvent::Exit(exit) => Some(exit.run_id),
            SessionEvent::Error { run_id, .. } => *run_id,
        }
    }

    /// True for the event that ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Exit(_) | SessionEvent::Error { run_id: Some(_), .. })
    }
}

/// Emits a run's events into its transport queue, stamping each with the
/// session-wide sequence counter. The queue is bounded, so emitting waits
/// when the transport falls behind.
#[derive(Debug, Clone)]
pub struct Emitter {
    run_id: u64,
    seq: Arc<AtomicU64>,
    tx: mpsc::Sender<SessionEvent>,
}

impl Emitter {
    pub fn new(run_id: u64, seq: Arc<AtomicU64>, tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { run_id, seq, tx }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns `false` once the transport has gone away.
    pub async fn output(&self, stream: StreamKind, data: Bytes) -> bool {
        let chunk = OutputChunk {
            run_id: self.run_id,
            seq: self.next_seq(),
            stream,
            data,
        };
        self.tx.send(SessionEvent::Output(chunk)).await.is_ok()
    }

    pub async fn system(&self, text: impl Into<String>) -> bool {
        self.output(StreamKind::System, Bytes::from(text.into())).await
    }

    pub async fn diagnostics(&self, report: CompileReport) -> bool {
        let event = SessionEvent::Diagnostics {
            run_id: self.run_id,
            seq: self.next_seq(),
            report,
        };
        self.tx.send(event).await.is_ok()
    }

    pub async fn review(&self, review: Review) -> bool {
        let event = SessionEvent::Review {
            run_id: self.run_id,
            seq: self.next_seq(),
            review,
        };
        self.tx.send(event).await.is_ok()
    }

    pub async fn exit(
        &self,
        code: i32,
        reason: ExitReason,
        needs_input: bool,
        elapsed_ms: u64,
    ) -> bool {
        let report = ExitReport {
            run_id: self.run_id,
            seq: self.next_seq(),
            code,
            reason,
            needs_input,
            elapsed_ms,
        };
        self.tx.send(SessionEvent::Exit(report)).await.is_ok()
    }

    pub async fn error(&self, message: impl Into<String>) -> bool {
        let event = SessionEvent::Error {
            run_id: Some(self.run_id),
            message: message.into(),
        };
        self.tx.send(event).await.is_ok()
    }
}
