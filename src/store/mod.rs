//! Dataset Store
//!
//! Owns the persisted datasets, their equipment records and raw-file blobs.
//! An ingest persists the header and every record as one unit and then runs
//! the retention sweep inside the same critical section, so readers never
//! see a half-written dataset and the store never settles above its limit.
//!
//! Two backends implement [`DatasetStore`]:
//! - [`MemoryStore`]: arena maps behind a `tokio::sync::RwLock`
//! - [`PgStore`]: Postgres, one transaction per ingest plus an advisory lock
//!   around the count-and-evict step

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{info, warn};

use crate::analysis::summarize;
use crate::models::{AnalyticsSnapshot, Dataset, DatasetDetail, DatasetId, EquipmentRecord, ValidatedRow};
use crate::storage::{BlobHandle, BlobStore};

pub mod memory;
pub mod postgres;
pub mod retention;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use retention::RetentionPolicy;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Dataset {0} not found")]
    NotFound(DatasetId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Retention invariant violated: {found} datasets stored, limit is {limit}")]
    CapacityInvariantViolation { limit: usize, found: usize },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Uploaded file kept verbatim next to the dataset.
#[derive(Debug, Clone)]
pub struct RawFile {
    pub filename: String,
    pub data: Bytes,
}

/// Everything needed to create a dataset.
#[derive(Debug, Clone)]
pub struct NewDataset {
    pub name: String,
    pub owner: String,
    pub rows: Vec<ValidatedRow>,
    pub raw_file: Option<RawFile>,
}

#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Persist a dataset with all its records atomically, then sweep.
    ///
    /// The returned detail is captured inside the same critical section, so
    /// it stays valid even if a later ingest evicts the dataset before the
    /// caller reads it.
    async fn ingest(&self, new: NewDataset) -> StoreResult<DatasetDetail>;

    /// Header only; no records are loaded.
    async fn dataset(&self, id: DatasetId) -> StoreResult<Dataset>;

    /// Header plus every record, name-sorted.
    async fn get(&self, id: DatasetId) -> StoreResult<(Dataset, Vec<EquipmentRecord>)>;

    /// All datasets, newest first.
    async fn list(&self) -> StoreResult<Vec<Dataset>>;

    /// Records sorted by name ascending (then record id), at most `limit`.
    async fn records(&self, id: DatasetId, limit: Option<usize>) -> StoreResult<Vec<EquipmentRecord>>;

    /// Remove a dataset, its records and its raw file.
    async fn delete(&self, id: DatasetId) -> StoreResult<()>;

    async fn raw_file(&self, id: DatasetId) -> StoreResult<Bytes>;

    fn retention(&self) -> RetentionPolicy;

    fn backend(&self) -> &'static str;

    /// Re-derive the snapshot from the records currently stored.
    async fn recompute(&self, id: DatasetId) -> StoreResult<AnalyticsSnapshot> {
        let records = self.records(id, None).await?;
        summarize(&records)
            .ok_or_else(|| StoreError::Storage(format!("dataset {id} has no stored records")))
    }
}

/// Snapshot for a row set about to be ingested; empty sets cannot be stored.
pub(crate) fn snapshot_for(rows: &[ValidatedRow]) -> StoreResult<AnalyticsSnapshot> {
    summarize(rows).ok_or_else(|| StoreError::Storage("cannot ingest an empty row set".to_string()))
}

/// Write the raw file, if any, before the dataset itself is persisted.
pub(crate) async fn store_raw_file(
    blobs: &dyn BlobStore,
    raw_file: Option<RawFile>,
) -> StoreResult<Option<BlobHandle>> {
    match raw_file {
        Some(file) => Ok(Some(blobs.put(&file.filename, file.data).await?)),
        None => Ok(None),
    }
}

/// Release blobs whose datasets are already gone. Failures leave an orphaned
/// file behind and are logged; the dataset deletion itself has committed.
pub(crate) async fn release_blobs(blobs: &dyn BlobStore, handles: impl IntoIterator<Item = BlobHandle>) {
    for handle in handles {
        if let Err(e) = blobs.delete(&handle).await {
            warn!(blob = %handle, error = %e, "Failed to delete raw file");
        }
    }
}

pub(crate) fn log_evictions(evicted: &[DatasetId], kept_for: DatasetId) {
    for id in evicted {
        info!(dataset_id = %id, new_dataset_id = %kept_for, "Evicted dataset by retention");
    }
}
