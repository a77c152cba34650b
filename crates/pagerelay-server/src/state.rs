//! Shared server state passed to every handler via axum `State`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use pagerelay::{Broker, ConnectionRegistry, EventBus, FileLedger, RelayConfig, RunStore};
use tokio::sync::Notify;

use crate::materializer::HttpMaterializer;

pub struct AppState {
    pub config: RelayConfig,
    pub data_dir: PathBuf,
    pub registry: Arc<ConnectionRegistry>,
    pub broker: Arc<Broker>,
    pub events: Arc<EventBus>,
    pub ledger: Arc<FileLedger>,
    pub store: RunStore,
    pub materializer: Arc<HttpMaterializer>,
    pub started_at: Instant,
    /// Notified on shutdown; stops the liveness sweeper.
    pub shutdown: Arc<Notify>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("data_dir", &self.data_dir)
            .field("workers", &self.registry.len())
            .field("in_flight", &self.broker.in_flight())
            .finish()
    }
}

impl AppState {
    /// Open the data directory and build every shared component.
    pub fn open(data_dir: impl AsRef<Path>, config: RelayConfig) -> anyhow::Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;

        let ledger = FileLedger::open_in(&data_dir)
            .with_context(|| format!("failed to open ledger in {}", data_dir.display()))?;
        let materializer =
            HttpMaterializer::new(&data_dir).context("failed to build HTTP client")?;

        let registry = Arc::new(ConnectionRegistry::new(config.heartbeat_interval));
        let broker = Arc::new(Broker::new(Arc::clone(&registry), config.request_timeout));

        Ok(Self {
            store: RunStore::new(&data_dir),
            data_dir,
            registry,
            broker,
            events: Arc::new(EventBus::default()),
            ledger: Arc::new(ledger),
            materializer: Arc::new(materializer),
            started_at: Instant::now(),
            shutdown: Arc::new(Notify::new()),
            config,
        })
    }
}
