use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::keys::KeyManager;
use crate::db::schema_cache::SchemaCache;
use crate::engine::Pipeline;
use crate::ingest::IngestManager;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: Arc<Pipeline>,
    pub ingest: IngestManager,
    pub keys: KeyManager,
    pub cache: Arc<SchemaCache>,
    pub data_dir: PathBuf,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        pipeline: Arc<Pipeline>,
        ingest: IngestManager,
        keys: KeyManager,
        cache: Arc<SchemaCache>,
    ) -> Self {
        Self {
            data_dir: PathBuf::from(&config.data_dir),
            config,
            pipeline,
            ingest,
            keys,
            cache,
            startup_time: chrono::Utc::now(),
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}
