//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::pipeline::Engine;
use crate::registry::Registry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub engine: Arc<Engine>,
    /// First line of `java -version`, read once at startup.
    pub java_version: Option<Arc<str>>,
    /// Flipped to `true` when the server starts shutting down.
    pub shutdown: Arc<watch::Sender<bool>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Engine, java_version: Option<String>) -> Self {
        let config = engine.config();
        let registry = Registry::new(config.stdin_queue_capacity, config.stdin_queue_bytes);
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            engine: Arc::new(engine),
            java_version: java_version.map(Arc::from),
            shutdown: Arc::new(shutdown),
            started_at: Instant::now(),
        }
    }

    /// Tell every open terminal to close.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
