//! Error types for the run pipeline and session protocol.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Failures that abort a run. User program failures (compile errors,
/// non-zero exits) are not errors; they travel as run results.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No code provided")]
    EmptySource,

    #[error("workspace {path}: {source}")]
    WorkspaceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("compilation timed out after {}s", .0.as_secs())]
    CompileTimeout(Duration),

    #[error("run stopped")]
    Stopped,

    #[error("server busy: {0} programs already running")]
    Busy(usize),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn workspace_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::WorkspaceIo {
            path: path.into(),
            source,
        }
    }

    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }
}

/// Protocol misuse against a session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot {op} while session is {state}")]
    InvalidState { op: &'static str, state: SessionState },

    #[error("stdin buffer full; input dropped")]
    StdinFull,

    #[error("session is closed")]
    Closed,
}
