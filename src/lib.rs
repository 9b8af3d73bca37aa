// Equipment Analytics - CSV ingestion, summary statistics and bounded dataset retention

pub mod config;
pub mod db;
pub mod models;
pub mod types;
pub mod validation;  // Row Validator: CSV text -> typed rows
pub mod analysis;    // Analytics Engine: rows -> snapshot
pub mod store;       // Dataset Store: atomic ingest + retention sweep
pub mod storage;     // Raw-file blobs
pub mod pipeline;
pub mod report;
pub mod routes;
pub mod middleware;

use std::sync::Arc;

use tracing::info;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;

use pipeline::IngestService;
use storage::{BlobStore, LocalBlobStore};
use store::{DatasetStore, MemoryStore, PgStore};

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}

/// Wire the store backend chosen by configuration: Postgres when a
/// database URL is configured, the in-memory store otherwise.
pub async fn build_state(config: Config) -> anyhow::Result<AppState> {
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(&config.storage.blob_dir));
    let retention = config.retention.policy();

    let store: Arc<dyn DatasetStore> = match &config.database.url {
        Some(url) => {
            let pool = db::connect_and_migrate(&config.database, url).await?;
            Arc::new(PgStore::new(pool, blobs, retention))
        }
        None => Arc::new(MemoryStore::new(blobs, retention)),
    };
    info!(
        backend = store.backend(),
        max_datasets = retention.max_datasets(),
        blob_dir = %config.storage.blob_dir,
        "Dataset store ready"
    );

    let service = IngestService::new(store, config.report.preview_limit);
    Ok(AppState { service, config })
}
