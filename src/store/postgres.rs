use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Transaction};
use tracing::{debug, info};

use super::{
    log_evictions, release_blobs, snapshot_for, store_raw_file, DatasetStore, NewDataset,
    RetentionPolicy, StoreError, StoreResult,
};
use crate::models::{
    AnalyticsSnapshot, Dataset, DatasetDetail, DatasetId, EquipmentRecord, FieldStats, ValidatedRow,
};
use crate::storage::{BlobHandle, BlobStore};

/// Advisory lock key serializing the count-and-evict step across sessions.
const SWEEP_LOCK_KEY: i64 = 0x5245_5445_4e54_494f;

/// Rows per multi-row INSERT; 6 binds each stays far below the protocol's
/// 65535 parameter limit.
const RECORD_BATCH_SIZE: usize = 1000;

const DATASET_COLUMNS: &str = "id, name, owner, uploaded_at, raw_file, total_equipment, \
    min_flowrate, avg_flowrate, max_flowrate, \
    min_pressure, avg_pressure, max_pressure, \
    min_temperature, avg_temperature, max_temperature, equipment_types";

#[derive(Debug, sqlx::FromRow)]
struct DatasetRow {
    id: i64,
    name: String,
    owner: String,
    uploaded_at: DateTime<Utc>,
    raw_file: Option<String>,
    total_equipment: i64,
    min_flowrate: f64,
    avg_flowrate: f64,
    max_flowrate: f64,
    min_pressure: f64,
    avg_pressure: f64,
    max_pressure: f64,
    min_temperature: f64,
    avg_temperature: f64,
    max_temperature: f64,
    equipment_types: Json<BTreeMap<String, u64>>,
}

impl From<DatasetRow> for Dataset {
    fn from(row: DatasetRow) -> Self {
        Dataset {
            id: DatasetId(row.id),
            name: row.name,
            owner: row.owner,
            uploaded_at: row.uploaded_at,
            row_count: row.total_equipment as u64,
            snapshot: AnalyticsSnapshot {
                count: row.total_equipment as u64,
                flowrate: FieldStats { min: row.min_flowrate, mean: row.avg_flowrate, max: row.max_flowrate },
                pressure: FieldStats { min: row.min_pressure, mean: row.avg_pressure, max: row.max_pressure },
                temperature: FieldStats {
                    min: row.min_temperature,
                    mean: row.avg_temperature,
                    max: row.max_temperature,
                },
                category_counts: row.equipment_types.0,
            },
            raw_file: row.raw_file.map(BlobHandle::new),
        }
    }
}

/// Postgres-backed dataset store.
///
/// Ingest runs in a single transaction: header insert, batched record
/// inserts, then `pg_advisory_xact_lock` before the sweep. Inserts from
/// independent uploads proceed in parallel; only the sweep is serialized, and
/// each sweep re-reads the committed population after taking the lock.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    blobs: Arc<dyn BlobStore>,
    retention: RetentionPolicy,
}

impl PgStore {
    pub fn new(pool: PgPool, blobs: Arc<dyn BlobStore>, retention: RetentionPolicy) -> Self {
        Self { pool, blobs, retention }
    }

    async fn ingest_tx(
        &self,
        name: &str,
        owner: &str,
        rows: &[ValidatedRow],
        snapshot: &AnalyticsSnapshot,
        raw_file: Option<&BlobHandle>,
    ) -> StoreResult<(DatasetDetail, Vec<DatasetId>, Vec<BlobHandle>)> {
        let mut tx = self.pool.begin().await?;

        let row: DatasetRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO datasets (name, owner, raw_file, total_equipment,
                min_flowrate, avg_flowrate, max_flowrate,
                min_pressure, avg_pressure, max_pressure,
                min_temperature, avg_temperature, max_temperature, equipment_types)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {DATASET_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(owner)
        .bind(raw_file.map(BlobHandle::as_str))
        .bind(snapshot.count as i64)
        .bind(snapshot.flowrate.min)
        .bind(snapshot.flowrate.mean)
        .bind(snapshot.flowrate.max)
        .bind(snapshot.pressure.min)
        .bind(snapshot.pressure.mean)
        .bind(snapshot.pressure.max)
        .bind(snapshot.temperature.min)
        .bind(snapshot.temperature.mean)
        .bind(snapshot.temperature.max)
        .bind(Json(&snapshot.category_counts))
        .fetch_one(&mut *tx)
        .await?;
        let mut dataset = Dataset::from(row);

        for chunk in rows.chunks(RECORD_BATCH_SIZE) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO equipment_records \
                 (dataset_id, equipment_name, equipment_type, flowrate, pressure, temperature) ",
            );
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(dataset.id.0)
                    .push_bind(&r.name)
                    .push_bind(&r.equipment_type)
                    .push_bind(r.flowrate)
                    .push_bind(r.pressure)
                    .push_bind(r.temperature);
            });
            builder.build().execute(&mut *tx).await?;
        }

        let (uploaded_at, victims, evicted_blobs) = self.sweep(&mut tx, dataset.id).await?;
        dataset.uploaded_at = uploaded_at;
        let equipment_records = Self::fetch_records(&mut *tx, dataset.id, None).await?;
        tx.commit().await?;

        Ok((DatasetDetail { dataset, equipment_records }, victims, evicted_blobs))
    }

    /// Count-and-evict under the advisory lock. Runs inside the ingest
    /// transaction; any error rolls the whole ingest back.
    ///
    /// `NOW()` is the transaction start, which can predate datasets committed
    /// while this one was inserting records. The new header is restamped
    /// under the lock, no earlier than anything stored, so it always ranks
    /// newest and is never evicted by its own sweep.
    async fn sweep(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        new_id: DatasetId,
    ) -> StoreResult<(DateTime<Utc>, Vec<DatasetId>, Vec<BlobHandle>)> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SWEEP_LOCK_KEY)
            .execute(&mut **tx)
            .await?;

        let uploaded_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            UPDATE datasets
            SET uploaded_at = GREATEST(clock_timestamp(), (SELECT MAX(uploaded_at) FROM datasets))
            WHERE id = $1
            RETURNING uploaded_at
            "#,
        )
        .bind(new_id.0)
        .fetch_one(&mut **tx)
        .await?;

        let entries: Vec<(DateTime<Utc>, DatasetId)> =
            sqlx::query_as("SELECT uploaded_at, id FROM datasets")
                .fetch_all(&mut **tx)
                .await?;
        let victims = self.retention.select_victims(&entries);

        let mut evicted_blobs = Vec::new();
        if !victims.is_empty() {
            let ids: Vec<i64> = victims.iter().map(|id| id.0).collect();
            sqlx::query("DELETE FROM equipment_records WHERE dataset_id = ANY($1)")
                .bind(&ids)
                .execute(&mut **tx)
                .await?;
            let handles: Vec<Option<String>> =
                sqlx::query_scalar("DELETE FROM datasets WHERE id = ANY($1) RETURNING raw_file")
                    .bind(&ids)
                    .fetch_all(&mut **tx)
                    .await?;
            evicted_blobs.extend(handles.into_iter().flatten().map(BlobHandle::new));
        }

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM datasets")
            .fetch_one(&mut **tx)
            .await?;
        self.retention.check(remaining as usize)?;

        Ok((uploaded_at, victims, evicted_blobs))
    }

    async fn fetch_dataset<'e, E>(executor: E, id: DatasetId) -> StoreResult<Dataset>
    where
        E: sqlx::postgres::PgExecutor<'e>,
    {
        let row: Option<DatasetRow> =
            sqlx::query_as(&format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(executor)
                .await?;
        row.map(Dataset::from).ok_or(StoreError::NotFound(id))
    }

    async fn fetch_records<'e, E>(
        executor: E,
        id: DatasetId,
        limit: Option<usize>,
    ) -> StoreResult<Vec<EquipmentRecord>>
    where
        E: sqlx::postgres::PgExecutor<'e>,
    {
        // byte-order collation so slices agree with the in-memory backend
        let records = sqlx::query_as::<_, EquipmentRecord>(
            r#"
            SELECT id, dataset_id, equipment_name, equipment_type, flowrate, pressure, temperature
            FROM equipment_records
            WHERE dataset_id = $1
            ORDER BY equipment_name COLLATE "C" ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(id.0)
        .bind(limit.map(|l| l as i64))
        .fetch_all(executor)
        .await?;
        Ok(records)
    }

    /// Reads header and records from one snapshot, so an eviction committing
    /// in between cannot hand back a header without its records.
    async fn begin_read(&self) -> StoreResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

#[async_trait]
impl DatasetStore for PgStore {
    async fn ingest(&self, new: NewDataset) -> StoreResult<DatasetDetail> {
        let snapshot = snapshot_for(&new.rows)?;
        let raw_file = store_raw_file(self.blobs.as_ref(), new.raw_file).await?;

        match self
            .ingest_tx(&new.name, &new.owner, &new.rows, &snapshot, raw_file.as_ref())
            .await
        {
            Ok((detail, victims, evicted_blobs)) => {
                log_evictions(&victims, detail.dataset.id);
                release_blobs(self.blobs.as_ref(), evicted_blobs).await;
                info!(dataset_id = %detail.dataset.id, rows = detail.dataset.row_count, "Dataset ingested");
                Ok(detail)
            }
            Err(e) => {
                // the transaction rolled back; drop the blob written for it
                release_blobs(self.blobs.as_ref(), raw_file).await;
                Err(e)
            }
        }
    }

    async fn dataset(&self, id: DatasetId) -> StoreResult<Dataset> {
        Self::fetch_dataset(&self.pool, id).await
    }

    async fn get(&self, id: DatasetId) -> StoreResult<(Dataset, Vec<EquipmentRecord>)> {
        let mut tx = self.begin_read().await?;
        let dataset = Self::fetch_dataset(&mut *tx, id).await?;
        let records = Self::fetch_records(&mut *tx, id, None).await?;
        tx.commit().await?;
        Ok((dataset, records))
    }

    async fn list(&self) -> StoreResult<Vec<Dataset>> {
        let rows: Vec<DatasetRow> = sqlx::query_as(&format!(
            "SELECT {DATASET_COLUMNS} FROM datasets ORDER BY uploaded_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Dataset::from).collect())
    }

    async fn records(&self, id: DatasetId, limit: Option<usize>) -> StoreResult<Vec<EquipmentRecord>> {
        let mut tx = self.begin_read().await?;
        Self::fetch_dataset(&mut *tx, id).await?;
        let records = Self::fetch_records(&mut *tx, id, limit).await?;
        tx.commit().await?;
        Ok(records)
    }

    async fn delete(&self, id: DatasetId) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM equipment_records WHERE dataset_id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        // a concurrent eviction that got here first leaves no row: NotFound
        let deleted: Option<Option<String>> =
            sqlx::query_scalar("DELETE FROM datasets WHERE id = $1 RETURNING raw_file")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let raw_file = deleted.ok_or(StoreError::NotFound(id))?;
        tx.commit().await?;

        release_blobs(self.blobs.as_ref(), raw_file.map(BlobHandle::new)).await;
        debug!(dataset_id = %id, "Dataset deleted");
        Ok(())
    }

    async fn raw_file(&self, id: DatasetId) -> StoreResult<Bytes> {
        let dataset = Self::fetch_dataset(&self.pool, id).await?;
        let handle = dataset
            .raw_file
            .ok_or_else(|| StoreError::Storage(format!("dataset {id} has no raw file")))?;
        Ok(self.blobs.get(&handle).await?)
    }

    fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
