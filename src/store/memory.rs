use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    log_evictions, release_blobs, snapshot_for, store_raw_file, DatasetStore, NewDataset,
    RetentionPolicy, StoreError, StoreResult,
};
use crate::models::{Dataset, DatasetDetail, DatasetId, EquipmentRecord, ValidatedRow};
use crate::storage::{BlobHandle, BlobStore};

#[derive(Default)]
struct Inner {
    next_dataset_id: i64,
    next_record_id: i64,
    datasets: BTreeMap<DatasetId, Dataset>,
    /// Kept sorted by (name, id).
    records: HashMap<DatasetId, Vec<EquipmentRecord>>,
}

impl Inner {
    /// Detach a dataset and its records, handing back its blob handle.
    fn remove(&mut self, id: DatasetId) -> Option<Option<BlobHandle>> {
        let dataset = self.datasets.remove(&id)?;
        self.records.remove(&id);
        Some(dataset.raw_file)
    }
}

/// In-process dataset store. The write lock is the transaction boundary:
/// insert, sweep and the post-sweep count check all happen under one guard.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    blobs: Arc<dyn BlobStore>,
    retention: RetentionPolicy,
}

impl MemoryStore {
    pub fn new(blobs: Arc<dyn BlobStore>, retention: RetentionPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner { next_dataset_id: 1, next_record_id: 1, ..Default::default() })),
            blobs,
            retention,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.datasets.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn sorted_rows(mut rows: Vec<ValidatedRow>) -> Vec<ValidatedRow> {
    // stable sort keeps input order among equal names, matching id order
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    rows
}

#[async_trait]
impl DatasetStore for MemoryStore {
    async fn ingest(&self, new: NewDataset) -> StoreResult<DatasetDetail> {
        let snapshot = snapshot_for(&new.rows)?;
        let raw_file = store_raw_file(self.blobs.as_ref(), new.raw_file).await?;
        let rows = sorted_rows(new.rows);

        let swept = {
            let mut inner = self.inner.write().await;

            let id = DatasetId(inner.next_dataset_id);
            // never older than anything already stored, so a new dataset
            // cannot be chosen as a victim of its own sweep
            let now = Utc::now();
            let uploaded_at = inner
                .datasets
                .values()
                .map(|d| d.uploaded_at)
                .max()
                .map_or(now, |latest| now.max(latest));

            // decide victims and verify the resulting count before mutating
            let mut entries: Vec<_> = inner.datasets.values().map(|d| (d.uploaded_at, d.id)).collect();
            entries.push((uploaded_at, id));
            let victims = self.retention.select_victims(&entries);
            match self.retention.check(entries.len() - victims.len()) {
                Ok(()) => {
                    inner.next_dataset_id += 1;
                    let first_record_id = inner.next_record_id;
                    inner.next_record_id += rows.len() as i64;
                    let records: Vec<EquipmentRecord> = rows
                        .into_iter()
                        .enumerate()
                        .map(|(offset, row)| EquipmentRecord {
                            id: first_record_id + offset as i64,
                            dataset_id: id,
                            name: row.name,
                            equipment_type: row.equipment_type,
                            flowrate: row.flowrate,
                            pressure: row.pressure,
                            temperature: row.temperature,
                        })
                        .collect();

                    let dataset = Dataset {
                        id,
                        name: new.name,
                        owner: new.owner,
                        uploaded_at,
                        row_count: records.len() as u64,
                        snapshot,
                        raw_file,
                    };
                    let detail = DatasetDetail { dataset: dataset.clone(), equipment_records: records.clone() };
                    inner.datasets.insert(id, dataset);
                    inner.records.insert(id, records);

                    let mut evicted_blobs = Vec::with_capacity(victims.len());
                    for victim in &victims {
                        if let Some(handle) = inner.remove(*victim) {
                            evicted_blobs.extend(handle);
                        }
                    }
                    log_evictions(&victims, id);
                    Ok((detail, evicted_blobs))
                }
                Err(e) => Err((e, raw_file)),
            }
        };

        match swept {
            Ok((detail, evicted)) => {
                release_blobs(self.blobs.as_ref(), evicted).await;
                info!(dataset_id = %detail.dataset.id, rows = detail.dataset.row_count, "Dataset ingested");
                Ok(detail)
            }
            Err((e, raw_file)) => {
                // nothing was inserted; drop the blob written for it
                release_blobs(self.blobs.as_ref(), raw_file).await;
                Err(e)
            }
        }
    }

    async fn dataset(&self, id: DatasetId) -> StoreResult<Dataset> {
        let inner = self.inner.read().await;
        inner.datasets.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn get(&self, id: DatasetId) -> StoreResult<(Dataset, Vec<EquipmentRecord>)> {
        let inner = self.inner.read().await;
        let dataset = inner.datasets.get(&id).cloned().ok_or(StoreError::NotFound(id))?;
        let records = inner.records.get(&id).cloned().unwrap_or_default();
        Ok((dataset, records))
    }

    async fn list(&self) -> StoreResult<Vec<Dataset>> {
        let inner = self.inner.read().await;
        let mut datasets: Vec<Dataset> = inner.datasets.values().cloned().collect();
        datasets.sort_by(|a, b| (b.uploaded_at, b.id).cmp(&(a.uploaded_at, a.id)));
        Ok(datasets)
    }

    async fn records(&self, id: DatasetId, limit: Option<usize>) -> StoreResult<Vec<EquipmentRecord>> {
        let inner = self.inner.read().await;
        if !inner.datasets.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let records = inner.records.get(&id).map(Vec::as_slice).unwrap_or_default();
        let limit = limit.unwrap_or(records.len());
        Ok(records.iter().take(limit).cloned().collect())
    }

    async fn delete(&self, id: DatasetId) -> StoreResult<()> {
        let blob = {
            let mut inner = self.inner.write().await;
            inner.remove(id).ok_or(StoreError::NotFound(id))?
        };
        release_blobs(self.blobs.as_ref(), blob).await;
        debug!(dataset_id = %id, "Dataset deleted");
        Ok(())
    }

    async fn raw_file(&self, id: DatasetId) -> StoreResult<Bytes> {
        let handle = {
            let inner = self.inner.read().await;
            let dataset = inner.datasets.get(&id).ok_or(StoreError::NotFound(id))?;
            dataset.raw_file.clone()
        };
        let handle = handle
            .ok_or_else(|| StoreError::Storage(format!("dataset {id} has no raw file")))?;
        Ok(self.blobs.get(&handle).await?)
    }

    fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::summarize;
    use crate::storage::MemoryBlobStore;
    use crate::store::test_support::{new_dataset, row};
    use std::io;

    fn store_with(limit: usize) -> (MemoryStore, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        (MemoryStore::new(blobs.clone(), RetentionPolicy::new(limit)), blobs)
    }

    #[tokio::test]
    async fn test_ingest_then_get() {
        let (store, blobs) = store_with(5);
        let dataset = store.ingest(new_dataset("plant-a")).await.unwrap().dataset;

        assert_eq!(dataset.name, "plant-a");
        assert_eq!(dataset.owner, "alice");
        assert_eq!(dataset.row_count, 3);
        assert_eq!(dataset.snapshot.count, 3);
        assert!((dataset.snapshot.pressure.mean - 5.9).abs() < 1e-9);

        let (fetched, records) = store.get(dataset.id).await.unwrap();
        assert_eq!(fetched, dataset);
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Compressor-1", "Pump-1", "Valve-1"]);
        assert!(records.iter().all(|r| r.dataset_id == dataset.id));
        assert_eq!(blobs.len().await, 1);
    }

    #[tokio::test]
    async fn test_recompute_matches_cached_snapshot() {
        let (store, _) = store_with(5);
        let dataset = store.ingest(new_dataset("plant-a")).await.unwrap().dataset;
        let recomputed = store.recompute(dataset.id).await.unwrap();
        assert!(recomputed.approx_eq(&dataset.snapshot, 1e-12));
        assert_eq!(recomputed, dataset.snapshot);
    }

    #[tokio::test]
    async fn test_sixth_ingest_evicts_oldest() {
        let (store, blobs) = store_with(5);
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(store.ingest(new_dataset(&format!("ds-{i}"))).await.unwrap().dataset.id);
        }

        let listed: Vec<DatasetId> = store.list().await.unwrap().iter().map(|d| d.id).collect();
        let expected: Vec<DatasetId> = ids[1..].iter().rev().copied().collect();
        assert_eq!(listed, expected);
        assert!(matches!(store.get(ids[0]).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.records(ids[0], None).await, Err(StoreError::NotFound(_))));
        assert_eq!(blobs.len().await, 5);
    }

    #[tokio::test]
    async fn test_retention_after_many_ingests() {
        let (store, _) = store_with(3);
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(store.ingest(new_dataset(&format!("ds-{i}"))).await.unwrap().dataset.id);
            assert!(store.len().await <= 3);
        }
        let listed: Vec<DatasetId> = store.list().await.unwrap().iter().map(|d| d.id).collect();
        assert_eq!(listed, vec![ids[9], ids[8], ids[7]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ingests_settle_at_limit() {
        let (store, blobs) = store_with(5);
        let mut handles = Vec::new();
        for i in 0..24 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.ingest(new_dataset(&format!("ds-{i}"))).await.unwrap().dataset.id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 5);
        assert_eq!(blobs.len().await, 5);
        let mut kept: Vec<DatasetId> = listed.iter().map(|d| d.id).collect();
        kept.sort();
        assert_eq!(kept, ids[ids.len() - 5..].to_vec());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_ingest_detail_survives_later_eviction() {
        let (store, blobs) = store_with(1);
        let mut handles = Vec::new();
        for i in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.ingest(new_dataset(&format!("ds-{i}"))).await }));
        }
        for handle in handles {
            let detail = handle.await.unwrap().unwrap();
            let names: Vec<&str> = detail.equipment_records.iter().map(|r| r.name.as_str()).collect();
            assert_eq!(names, vec!["Compressor-1", "Pump-1", "Valve-1"]);
            assert!(detail.equipment_records.iter().all(|r| r.dataset_id == detail.dataset.id));
            assert_eq!(detail.dataset.row_count, 3);
        }

        assert_eq!(store.len().await, 1);
        assert_eq!(blobs.len().await, 1);
    }

    #[tokio::test]
    async fn test_new_dataset_is_never_its_own_victim() {
        let (store, _) = store_with(1);
        for i in 0..20 {
            let detail = store.ingest(new_dataset(&format!("ds-{i}"))).await.unwrap();
            let listed: Vec<DatasetId> = store.list().await.unwrap().iter().map(|d| d.id).collect();
            assert_eq!(listed, vec![detail.dataset.id]);
        }
    }

    #[tokio::test]
    async fn test_header_lookup() {
        let (store, _) = store_with(5);
        let detail = store.ingest(new_dataset("plant-a")).await.unwrap();
        assert_eq!(store.dataset(detail.dataset.id).await.unwrap(), detail.dataset);
        assert!(matches!(store.dataset(DatasetId(999)).await, Err(StoreError::NotFound(_))));
    }

    /// Counts deletions per handle on top of the in-memory blob store.
    #[derive(Default)]
    struct CountingBlobs {
        inner: MemoryBlobStore,
        deletes: std::sync::Mutex<HashMap<BlobHandle, usize>>,
    }

    impl CountingBlobs {
        fn deletes_of(&self, handle: &BlobHandle) -> usize {
            self.deletes.lock().unwrap().get(handle).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl BlobStore for CountingBlobs {
        async fn put(&self, filename: &str, data: Bytes) -> io::Result<BlobHandle> {
            self.inner.put(filename, data).await
        }
        async fn get(&self, handle: &BlobHandle) -> io::Result<Bytes> {
            self.inner.get(handle).await
        }
        async fn delete(&self, handle: &BlobHandle) -> io::Result<()> {
            *self.deletes.lock().unwrap().entry(handle.clone()).or_insert(0) += 1;
            self.inner.delete(handle).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delete_racing_eviction_removes_once() {
        for round in 0..50 {
            let blobs = Arc::new(CountingBlobs::default());
            let store = MemoryStore::new(blobs.clone(), RetentionPolicy::new(1));
            let oldest = store.ingest(new_dataset(&format!("old-{round}"))).await.unwrap().dataset;
            let oldest_blob = oldest.raw_file.clone().unwrap();
            let oldest_id = oldest.id;

            let deleters: Vec<_> = (0..2)
                .map(|_| {
                    let store = store.clone();
                    tokio::spawn(async move { store.delete(oldest_id).await })
                })
                .collect();
            let ingester = {
                let store = store.clone();
                tokio::spawn(async move { store.ingest(new_dataset(&format!("new-{round}"))).await })
            };

            let mut removed_by_delete = 0;
            for deleter in deleters {
                match deleter.await.unwrap() {
                    Ok(()) => removed_by_delete += 1,
                    Err(StoreError::NotFound(id)) => assert_eq!(id, oldest_id),
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            let newest = ingester.await.unwrap().unwrap().dataset;

            // one delete wins, or the sweep got there first and both see NotFound
            assert!(removed_by_delete <= 1);
            assert_eq!(blobs.deletes_of(&oldest_blob), 1);
            assert!(matches!(store.get(oldest_id).await, Err(StoreError::NotFound(_))));
            let listed: Vec<DatasetId> = store.list().await.unwrap().iter().map(|d| d.id).collect();
            assert_eq!(listed, vec![newest.id]);
        }
    }

    #[tokio::test]
    async fn test_delete_cascades_and_is_not_found_twice() {
        let (store, blobs) = store_with(5);
        let dataset = store.ingest(new_dataset("plant-a")).await.unwrap().dataset;
        store.delete(dataset.id).await.unwrap();

        assert!(store.is_empty().await);
        assert!(blobs.is_empty().await);
        assert!(matches!(store.delete(dataset.id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.recompute(dataset.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_preview_slice_is_name_sorted() {
        let (store, _) = store_with(5);
        let mut new = new_dataset("big");
        new.rows = (0..80).rev().map(|i| row(&format!("eq-{i:03}"), "Pump", 1.0, 2.0, 3.0)).collect();
        let dataset = store.ingest(new).await.unwrap().dataset;

        let first = store.records(dataset.id, Some(50)).await.unwrap();
        assert_eq!(first.len(), 50);
        assert_eq!(first[0].name, "eq-000");
        assert_eq!(first[49].name, "eq-049");
        assert_eq!(store.records(dataset.id, Some(50)).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_raw_file_download() {
        let (store, _) = store_with(5);
        let dataset = store.ingest(new_dataset("plant-a")).await.unwrap().dataset;
        let bytes = store.raw_file(dataset.id).await.unwrap();
        assert_eq!(bytes, Bytes::from("raw bytes of plant-a"));
    }

    struct FailingBlobs;

    #[async_trait]
    impl BlobStore for FailingBlobs {
        async fn put(&self, _: &str, _: Bytes) -> io::Result<BlobHandle> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
        async fn get(&self, _: &BlobHandle) -> io::Result<Bytes> {
            Err(io::Error::new(io::ErrorKind::NotFound, "missing"))
        }
        async fn delete(&self, _: &BlobHandle) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_store_unchanged() {
        let store = MemoryStore::new(Arc::new(FailingBlobs), RetentionPolicy::default());
        let err = store.ingest(new_dataset("plant-a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_rows_rejected() {
        let (store, blobs) = store_with(5);
        let mut new = new_dataset("empty");
        new.rows.clear();
        assert!(matches!(store.ingest(new).await, Err(StoreError::Storage(_))));
        assert!(store.is_empty().await);
        assert!(blobs.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_names_keep_input_order() {
        let (store, _) = store_with(5);
        let mut new = new_dataset("dups");
        new.rows = vec![
            row("Pump", "A", 1.0, 1.0, 1.0),
            row("Pump", "B", 2.0, 2.0, 2.0),
        ];
        let dataset = store.ingest(new).await.unwrap().dataset;
        let records = store.records(dataset.id, None).await.unwrap();
        assert_eq!(records[0].equipment_type, "A");
        assert!(records[0].id < records[1].id);
        assert_eq!(summarize(&records).unwrap(), dataset.snapshot);
    }
}
