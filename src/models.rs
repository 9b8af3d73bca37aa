use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::pipeline::IngestService;
use crate::storage::BlobHandle;

#[derive(Clone)]
pub struct AppState {
    pub service: IngestService,
    pub config: Config,
}

/// Opaque dataset identifier. Assigned in increasing order, which makes it
/// usable as the tie-breaker of the retention order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct DatasetId(pub i64);

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row that survived validation. Everything downstream of the
/// validator works on this fixed schema instead of labelled cells.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRow {
    pub name: String,
    pub equipment_type: String,
    pub flowrate: f64,
    pub pressure: f64,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EquipmentRecord {
    pub id: i64,
    pub dataset_id: DatasetId,
    #[serde(rename = "equipment_name")]
    #[sqlx(rename = "equipment_name")]
    pub name: String,
    pub equipment_type: String,
    pub flowrate: f64,
    pub pressure: f64,
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldStats {
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

/// Aggregate statistics for a dataset. Only exists for non-empty row sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "SnapshotPayload", from = "SnapshotPayload")]
pub struct AnalyticsSnapshot {
    pub count: u64,
    pub flowrate: FieldStats,
    pub pressure: FieldStats,
    pub temperature: FieldStats,
    pub category_counts: BTreeMap<String, u64>,
}

impl AnalyticsSnapshot {
    /// Field-by-field comparison with an absolute/relative tolerance on the
    /// floating point statistics. Counts must match exactly.
    pub fn approx_eq(&self, other: &AnalyticsSnapshot, tolerance: f64) -> bool {
        fn close(a: f64, b: f64, tol: f64) -> bool {
            (a - b).abs() <= tol * a.abs().max(b.abs()).max(1.0)
        }
        fn stats_close(a: &FieldStats, b: &FieldStats, tol: f64) -> bool {
            close(a.min, b.min, tol) && close(a.mean, b.mean, tol) && close(a.max, b.max, tol)
        }

        self.count == other.count
            && self.category_counts == other.category_counts
            && stats_close(&self.flowrate, &other.flowrate, tolerance)
            && stats_close(&self.pressure, &other.pressure, tolerance)
            && stats_close(&self.temperature, &other.temperature, tolerance)
    }
}

/// Wire shape of [`AnalyticsSnapshot`], field names as the REST API has
/// always exposed them.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotPayload {
    total_equipment: u64,
    avg_flowrate: f64,
    avg_pressure: f64,
    avg_temperature: f64,
    min_flowrate: f64,
    max_flowrate: f64,
    min_pressure: f64,
    max_pressure: f64,
    min_temperature: f64,
    max_temperature: f64,
    equipment_types: BTreeMap<String, u64>,
}

impl From<AnalyticsSnapshot> for SnapshotPayload {
    fn from(s: AnalyticsSnapshot) -> Self {
        Self {
            total_equipment: s.count,
            avg_flowrate: s.flowrate.mean,
            avg_pressure: s.pressure.mean,
            avg_temperature: s.temperature.mean,
            min_flowrate: s.flowrate.min,
            max_flowrate: s.flowrate.max,
            min_pressure: s.pressure.min,
            max_pressure: s.pressure.max,
            min_temperature: s.temperature.min,
            max_temperature: s.temperature.max,
            equipment_types: s.category_counts,
        }
    }
}

impl From<SnapshotPayload> for AnalyticsSnapshot {
    fn from(p: SnapshotPayload) -> Self {
        Self {
            count: p.total_equipment,
            flowrate: FieldStats { min: p.min_flowrate, mean: p.avg_flowrate, max: p.max_flowrate },
            pressure: FieldStats { min: p.min_pressure, mean: p.avg_pressure, max: p.max_pressure },
            temperature: FieldStats {
                min: p.min_temperature,
                mean: p.avg_temperature,
                max: p.max_temperature,
            },
            category_counts: p.equipment_types,
        }
    }
}

/// Dataset header. Immutable once created; replaced, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    #[serde(rename = "uploaded_by")]
    pub owner: String,
    pub uploaded_at: DateTime<Utc>,
    pub row_count: u64,
    #[serde(flatten)]
    pub snapshot: AnalyticsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_file: Option<BlobHandle>,
}

// API Request/Response types

#[derive(Debug, Serialize)]
pub struct DatasetSummary {
    #[serde(flatten)]
    pub dataset: Dataset,
    pub equipment_count: u64,
}

impl From<Dataset> for DatasetSummary {
    fn from(dataset: Dataset) -> Self {
        let equipment_count = dataset.row_count;
        Self { dataset, equipment_count }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetDetail {
    #[serde(flatten)]
    pub dataset: Dataset,
    pub equipment_records: Vec<EquipmentRecord>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub store: String,
    pub retention_limit: usize,
}
