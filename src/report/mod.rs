//! Dataset reports
//!
//! [`ReportData`] is the exact shape handed to report rendering: header
//! fields, cached snapshot and a deterministic, name-sorted record slice.
//! [`pdf`] turns it into a plain paginated PDF document.

use serde::Serialize;

use crate::models::{AnalyticsSnapshot, Dataset, EquipmentRecord};

pub mod pdf;

pub use pdf::render_pdf;

#[derive(Debug, Clone, Serialize)]
pub struct ReportData {
    pub dataset: Dataset,
    /// Already flattened into `dataset` on the wire.
    #[serde(skip)]
    pub snapshot: AnalyticsSnapshot,
    pub records: Vec<EquipmentRecord>,
    pub total_records: u64,
    pub truncated: bool,
}

impl ReportData {
    pub fn new(dataset: Dataset, records: Vec<EquipmentRecord>) -> Self {
        let total_records = dataset.row_count;
        let truncated = (records.len() as u64) < total_records;
        Self {
            snapshot: dataset.snapshot.clone(),
            dataset,
            records,
            total_records,
            truncated,
        }
    }

    /// Suggested download file name.
    pub fn filename(&self) -> String {
        let stem: String = self
            .dataset
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
            .collect();
        format!("report_{stem}.pdf")
    }
}
