//! Application state wiring the engine to the SQLite store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use orchestrion_core::Orchestrator;
use orchestrion_infra::config::load_engine_config;
use orchestrion_infra::sqlite::{DatabasePool, SqliteStore};

/// The engine pinned to the concrete store.
pub type Engine = Orchestrator<SqliteStore>;

pub struct AppState {
    pub data_dir: PathBuf,
    pub store: Arc<SqliteStore>,
    pub engine: Engine,
}

impl AppState {
    /// Load `config.toml`, open the database and assemble the engine.
    pub async fn init(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let pool = DatabasePool::open_in(&data_dir)
            .await
            .with_context(|| format!("failed to open database in {}", data_dir.display()))?;
        let store = Arc::new(SqliteStore::new(pool));
        let engine = Orchestrator::new(Arc::clone(&store), config);

        tracing::debug!(data_dir = %data_dir.display(), node = %engine.config().engine.node_id, "application state ready");
        Ok(Self {
            data_dir,
            store,
            engine,
        })
    }
}
