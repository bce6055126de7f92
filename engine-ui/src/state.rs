//! Shared application state for the UI server.

use std::path::PathBuf;
use std::sync::Arc;

use engine::io::config::EngineConfig;
use engine::io::events::Event;
use engine::io::persistence::StatePersistence;
use tokio::sync::broadcast;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Engine state directory (contains `events.jsonl`, `sessions/`, `config.toml`).
    pub state_dir: PathBuf,
    /// Broadcast sender for engine events newly appended to the log.
    pub event_tx: Arc<broadcast::Sender<Event>>,
}

impl AppState {
    pub fn new(state_dir: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            state_dir,
            event_tx: Arc::new(event_tx),
        }
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir.join("events.jsonl")
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join("config.toml")
    }

    /// A persistence handle over this state directory. Cheap to build per
    /// request since it's just two `PathBuf`s; the checkpoint retention
    /// count only matters to writers, never to this read-only server.
    pub fn persistence(&self) -> StatePersistence {
        let retention = engine::io::config::load_config(&self.config_path())
            .unwrap_or_else(|_| EngineConfig::default())
            .checkpoint_retention;
        StatePersistence::new(self.state_dir.clone(), retention)
    }
}
