//! Ingestion pipeline and read surface
//!
//! raw bytes → [`RawTable`] → [`validate`] → [`DatasetStore::ingest`]
//! (snapshot + atomic persist + retention sweep). The read side exposes the
//! dataset list, detail, cross-checked analytics and the report slice.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{error, info};

use crate::models::{AnalyticsSnapshot, Dataset, DatasetDetail, DatasetId, EquipmentRecord};
use crate::report::ReportData;
use crate::store::{DatasetStore, NewDataset, RawFile};
use crate::types::{AppError, AppResult};
use crate::validation::{validate, RawTable};

/// Relative tolerance when comparing cached and recomputed snapshots.
const SNAPSHOT_TOLERANCE: f64 = 1e-9;

#[derive(Clone)]
pub struct IngestService {
    store: Arc<dyn DatasetStore>,
    preview_limit: usize,
}

impl IngestService {
    pub fn new(store: Arc<dyn DatasetStore>, preview_limit: usize) -> Self {
        Self { store, preview_limit }
    }

    pub fn store(&self) -> &Arc<dyn DatasetStore> {
        &self.store
    }

    /// Validate an uploaded CSV and persist it as a new dataset. Returns the
    /// created dataset with its records as captured by the ingest itself.
    pub async fn ingest_csv(
        &self,
        name: &str,
        owner: &str,
        filename: &str,
        data: Bytes,
    ) -> AppResult<DatasetDetail> {
        let table = RawTable::from_csv(&data)?;
        let rows = validate(&table)?;
        info!(
            name,
            owner,
            accepted = rows.len(),
            dropped = table.rows.len() - rows.len(),
            "Validated upload"
        );

        let detail = self
            .store
            .ingest(NewDataset {
                name: name.to_string(),
                owner: owner.to_string(),
                rows,
                raw_file: Some(RawFile { filename: filename.to_string(), data }),
            })
            .await?;
        Ok(detail)
    }

    pub async fn list(&self) -> AppResult<Vec<Dataset>> {
        Ok(self.store.list().await?)
    }

    pub async fn detail(&self, id: DatasetId) -> AppResult<DatasetDetail> {
        let (dataset, equipment_records) = self.store.get(id).await?;
        Ok(DatasetDetail { dataset, equipment_records })
    }

    pub async fn equipment(&self, id: DatasetId) -> AppResult<Vec<EquipmentRecord>> {
        Ok(self.store.records(id, None).await?)
    }

    /// Snapshot recomputed from stored records, checked against the one
    /// cached at ingest. Records are immutable, so a mismatch is a defect.
    pub async fn analytics(&self, id: DatasetId) -> AppResult<AnalyticsSnapshot> {
        let dataset = self.store.dataset(id).await?;
        let recomputed = self.store.recompute(id).await?;

        if !recomputed.approx_eq(&dataset.snapshot, SNAPSHOT_TOLERANCE) {
            error!(
                dataset_id = %id,
                cached = ?dataset.snapshot,
                recomputed = ?recomputed,
                "Cached analytics diverge from stored records"
            );
            return Err(AppError::Internal(format!(
                "analytics for dataset {id} diverge from its stored records"
            )));
        }
        Ok(recomputed)
    }

    /// Header, snapshot and the first records by name for report rendering.
    pub async fn report(&self, id: DatasetId) -> AppResult<ReportData> {
        let dataset = self.store.dataset(id).await?;
        let records = self.store.records(id, Some(self.preview_limit)).await?;
        Ok(ReportData::new(dataset, records))
    }

    pub async fn raw_file(&self, id: DatasetId) -> AppResult<(Dataset, Bytes)> {
        let dataset = self.store.dataset(id).await?;
        let data = self.store.raw_file(id).await?;
        Ok((dataset, data))
    }

    pub async fn delete(&self, id: DatasetId) -> AppResult<()> {
        self.store.delete(id).await?;
        info!(dataset_id = %id, "Dataset deleted on request");
        Ok(())
    }
}
