use std::collections::BTreeMap;

use crate::models::{AnalyticsSnapshot, EquipmentRecord, FieldStats, ValidatedRow};

/// Read access to one reading row, shared by freshly validated rows and
/// stored records so both paths go through the same reduction.
pub trait Reading {
    fn category(&self) -> &str;
    fn flowrate(&self) -> f64;
    fn pressure(&self) -> f64;
    fn temperature(&self) -> f64;
}

impl Reading for ValidatedRow {
    fn category(&self) -> &str {
        &self.equipment_type
    }
    fn flowrate(&self) -> f64 {
        self.flowrate
    }
    fn pressure(&self) -> f64 {
        self.pressure
    }
    fn temperature(&self) -> f64 {
        self.temperature
    }
}

impl Reading for EquipmentRecord {
    fn category(&self) -> &str {
        &self.equipment_type
    }
    fn flowrate(&self) -> f64 {
        self.flowrate
    }
    fn pressure(&self) -> f64 {
        self.pressure
    }
    fn temperature(&self) -> f64 {
        self.temperature
    }
}

/// Compute the aggregate snapshot of a row set. Returns `None` for an empty
/// input: an empty dataset has no snapshot.
///
/// The result depends only on the multiset of rows, never on their order;
/// values are summed in sorted order so the mean is bit-for-bit stable.
pub fn summarize<R: Reading>(rows: &[R]) -> Option<AnalyticsSnapshot> {
    if rows.is_empty() {
        return None;
    }

    let mut category_counts: BTreeMap<String, u64> = BTreeMap::new();
    for row in rows {
        *category_counts.entry(row.category().to_string()).or_insert(0) += 1;
    }

    Some(AnalyticsSnapshot {
        count: rows.len() as u64,
        flowrate: field_stats(rows.iter().map(Reading::flowrate)),
        pressure: field_stats(rows.iter().map(Reading::pressure)),
        temperature: field_stats(rows.iter().map(Reading::temperature)),
        category_counts,
    })
}

fn field_stats(values: impl Iterator<Item = f64>) -> FieldStats {
    let mut values: Vec<f64> = values.collect();
    values.sort_by(f64::total_cmp);

    let min = values.first().copied().unwrap_or(0.0);
    let max = values.last().copied().unwrap_or(0.0);
    let n = values.len() as f64;
    let sum: f64 = values.iter().sum();
    let mean = if sum.is_finite() {
        sum / n
    } else {
        // the plain sum overflowed; every scaled term is bounded by max |v|
        values.iter().map(|v| v / n).sum()
    };
    // population mean; clamped because rounding can push it a ulp outside
    let mean = mean.clamp(min, max);

    FieldStats { min, mean, max }
}
