//! Shared application state, configuration and per-identity registries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock, Semaphore};

use crate::store::Store;

/// Session TTL in seconds (1 day)
pub const SESSION_TTL_SECS: u64 = 86400;

/// Concurrent command runs allowed per identity.
pub const MAX_CONCURRENT_RUNS: usize = 4;

const LIVE_CHANNEL_CAPACITY: usize = 256;

/// Server configuration derived from CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub python: String,
    pub retention_days: u64,
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("webpad.db")
    }

    pub fn code_dir(&self) -> PathBuf {
        self.data_dir.join("code_files")
    }

    /// Per-identity directory holding materialized files; also the working
    /// directory for that identity's command runs.
    pub fn user_code_dir(&self, user_id: i64) -> PathBuf {
        self.code_dir().join(user_id.to_string())
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.data_dir.join("venv")
    }

    /// Interpreter used to run saved files: the venv python when the venv
    /// exists, the configured interpreter otherwise.
    pub fn interpreter(&self) -> String {
        let venv_python = self.venv_dir().join("bin").join("python");
        if venv_python.exists() {
            venv_python.display().to_string()
        } else {
            self.python.clone()
        }
    }

    /// Shell prefix activating the venv, when one exists.
    pub fn venv_activate_prefix(&self) -> Option<String> {
        let venv = self.venv_dir();
        if venv.exists() {
            Some(format!("source {}/bin/activate && ", venv.display()))
        } else {
            None
        }
    }
}

/// A browser session bound to one identity.
#[derive(Debug)]
pub struct SessionEntry {
    pub user_id: i64,
    pub username: String,
    pub created_at: Instant,
    pub last_used: Instant,
}

/// Thread-safe session storage, keyed by the `sid` cookie value.
pub type Sessions = Arc<RwLock<HashMap<String, SessionEntry>>>;

/// Per-identity live channels carrying serialized outbound events.
pub type LiveChannels = Arc<RwLock<HashMap<i64, broadcast::Sender<String>>>>;

/// Per-identity run permits bounding concurrent command executions.
pub type RunPermits = Arc<RwLock<HashMap<i64, Arc<Semaphore>>>>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub sessions: Sessions,
    live: LiveChannels,
    run_permits: RunPermits,
}

impl AppState {
    pub fn new(config: Arc<Config>, store: Store) -> Self {
        Self {
            config,
            store,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            live: Arc::new(RwLock::new(HashMap::new())),
            run_permits: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The live channel for one identity, created on first use. Output
    /// events are delivered only to subscribers of this channel, never to
    /// other identities' connections.
    pub async fn live_channel(&self, user_id: i64) -> broadcast::Sender<String> {
        if let Some(tx) = self.live.read().await.get(&user_id) {
            return tx.clone();
        }
        let mut channels = self.live.write().await;
        channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(LIVE_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// The run-permit semaphore for one identity, created on first use.
    pub async fn run_permit(&self, user_id: i64) -> Arc<Semaphore> {
        if let Some(sem) = self.run_permits.read().await.get(&user_id) {
            return sem.clone();
        }
        let mut permits = self.run_permits.write().await;
        permits
            .entry(user_id)
            .or_insert_with(|| Arc::new(Semaphore::new(MAX_CONCURRENT_RUNS)))
            .clone()
    }
}
