//! Connection id → session map.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::session::Session;

#[derive(Debug, Clone)]
pub struct Registry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    stdin_capacity: usize,
    stdin_bytes: usize,
}

impl Registry {
    pub fn new(stdin_capacity: usize, stdin_bytes: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            stdin_capacity,
            stdin_bytes,
        }
    }

    /// Session for `connection_id`, created idle on first use. Concurrent
    /// opens of the same id get the same session.
    pub async fn open(&self, connection_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(connection_id.to_string())
            .or_insert_with(|| {
                info!(session = %connection_id, "Session opened");
                Arc::new(
                    Session::new(connection_id, self.stdin_capacity)
                        .with_stdin_bytes(self.stdin_bytes),
                )
            })
            .clone()
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(connection_id).cloned()
    }

    /// Remove the session and stop its run. Idempotent; the process is
    /// reaped by the run's task after this returns.
    pub async fn close(&self, connection_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.write().await.remove(connection_id)?;
        session.close();
        info!(session = %connection_id, state = %session.state(), "Session closed");
        Some(session)
    }

    /// Close every session and wait for their runs to finish.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.close();
        }
        for session in sessions {
            session.join().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Sessions whose run is compiling or running.
    pub async fn active_runs(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.state().is_busy())
            .count()
    }
}
