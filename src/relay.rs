//! Bidirectional I/O relay between a running program and its session.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::event::{Emitter, StreamKind};
use crate::process::RunHandle;
use crate::session::StdinChunk;

const READ_CHUNK_SIZE: usize = 8192;
/// Bytes of each stream kept for error annotation after the run.
const TAIL_BYTES: usize = 16 * 1024;

/// Pumps attached to one program.
#[derive(Debug)]
pub struct Relay {
    stdout: Option<JoinHandle<io::Result<Vec<u8>>>>,
    stderr: Option<JoinHandle<io::Result<Vec<u8>>>>,
    stdin: Option<JoinHandle<()>>,
}

/// What the relay saw by the time it was drained.
#[derive(Debug, Default)]
pub struct Drained {
    pub stdout_tail: Vec<u8>,
    pub stderr_tail: Vec<u8>,
    /// A pump was still blocked when the drain deadline passed.
    pub incomplete: bool,
}

impl Relay {
    /// Take the handle's pipes and start pumping. Stdout and stderr get one
    /// task each; stdin chunks from `stdin_rx` are written in arrival order
    /// and the pipe is closed once every sender is gone.
    pub fn start(handle: &mut RunHandle, emitter: &Emitter, stdin_rx: mpsc::Receiver<StdinChunk>) -> Self {
        let stdout = handle
            .stdout
            .take()
            .map(|r| tokio::spawn(pump(r, StreamKind::Stdout, emitter.clone())));
        let stderr = handle
            .stderr
            .take()
            .map(|r| tokio::spawn(pump(r, StreamKind::Stderr, emitter.clone())));
        let stdin = handle
            .stdin
            .take()
            .map(|w| tokio::spawn(forward_stdin(w, stdin_rx)));
        Self { stdout, stderr, stdin }
    }

    /// Wait for both output pumps to hit EOF and deliver everything they
    /// read, bounded by `timeout`. Call after the process group is gone.
    pub async fn drain(mut self, timeout: Duration) -> Drained {
        if let Some(stdin) = self.stdin.take() {
            stdin.abort();
        }
        let mut drained = Drained::default();
        let joined = tokio::time::timeout(timeout, async {
            let out = join_pump(self.stdout.as_mut()).await;
            let err = join_pump(self.stderr.as_mut()).await;
            (out, err)
        })
        .await;
        match joined {
            Ok((out, err)) => {
                self.stdout = None;
                self.stderr = None;
                drained.stdout_tail = out;
                drained.stderr_tail = err;
            }
            Err(_) => {
                // Something outside the group still holds the pipes.
                warn!(?timeout, "Output pumps did not finish in time; abandoning them");
                // Wait for the cancellation so no chunk is emitted after this returns.
                for task in [self.stdout.take(), self.stderr.take()].into_iter().flatten() {
                    task.abort();
                    let _ = task.await;
                }
                drained.incomplete = true;
            }
        }
        drained
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        for task in [self.stdout.take(), self.stderr.take()].into_iter().flatten() {
            task.abort();
        }
        if let Some(task) = self.stdin.take() {
            task.abort();
        }
    }
}

async fn join_pump(task: Option<&mut JoinHandle<io::Result<Vec<u8>>>>) -> Vec<u8> {
    let Some(task) = task else { return Vec::new() };
    match task.await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            debug!(error = %e, "Output pump ended with a read error");
            Vec::new()
        }
        Err(e) => {
            debug!(error = %e, "Output pump task failed");
            Vec::new()
        }
    }
}

/// Read `reader` to EOF, emitting each read as a chunk. Keeps reading after
/// the transport is gone so the program never blocks on a full pipe.
async fn pump<R>(mut reader: R, stream: StreamKind, emitter: Emitter) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut tail = Tail::new(TAIL_BYTES);
    let mut connected = true;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);
        let cut = utf8_boundary(&pending);
        if cut == 0 {
            continue;
        }
        let chunk = Bytes::copy_from_slice(&pending[..cut]);
        pending.drain(..cut);
        tail.push(&chunk);
        if connected {
            connected = emitter.output(stream, chunk).await;
        }
    }

    if !pending.is_empty() {
        let chunk = Bytes::from(pending);
        tail.push(&chunk);
        if connected {
            emitter.output(stream, chunk).await;
        }
    }
    Ok(tail.into_vec())
}

async fn forward_stdin(mut stdin: ChildStdin, mut rx: mpsc::Receiver<StdinChunk>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = stdin.write_all(&chunk.data).await {
            debug!(error = %e, "Program closed stdin");
            return;
        }
        if stdin.flush().await.is_err() {
            return;
        }
    }
    // All senders dropped: closing the pipe delivers EOF.
}

/// Length of the longest prefix of `bytes` that does not end inside a UTF-8
/// sequence. Invalid bytes are passed through as-is.
pub fn utf8_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    let start = len.saturating_sub(3);
    for i in (start..len).rev() {
        let b = bytes[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match b {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return len,
        };
        return if len - i < width { i } else { len };
    }
    len
}

/// Bounded window over the most recent bytes of a stream.
#[derive(Debug)]
struct Tail {
    cap: usize,
    buf: Vec<u8>,
}

impl Tail {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: Vec::new(),
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.cap {
            let excess = self.buf.len() - self.cap;
            self.buf.drain(..excess);
        }
    }

    fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}
