use chrono::{DateTime, Utc};

use super::{StoreError, StoreResult};
use crate::models::DatasetId;

/// Bounded retention: only the `max_datasets` most recent datasets survive
/// an ingest. Recency is creation time descending, then id descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_datasets: usize,
}

impl RetentionPolicy {
    pub const DEFAULT_MAX_DATASETS: usize = 5;

    /// A limit of zero would evict every dataset right after creating it;
    /// it is raised to one.
    pub fn new(max_datasets: usize) -> Self {
        Self { max_datasets: max_datasets.max(1) }
    }

    pub fn max_datasets(&self) -> usize {
        self.max_datasets
    }

    /// Pick the datasets to evict from the full current population.
    pub fn select_victims(&self, entries: &[(DateTime<Utc>, DatasetId)]) -> Vec<DatasetId> {
        let mut ordered = entries.to_vec();
        ordered.sort_by(|a, b| b.cmp(a));
        ordered.into_iter().skip(self.max_datasets).map(|(_, id)| id).collect()
    }

    /// Post-sweep check. Exceeding the limit here means the sweep is broken.
    pub fn check(&self, remaining: usize) -> StoreResult<()> {
        if remaining > self.max_datasets {
            return Err(StoreError::CapacityInvariantViolation {
                limit: self.max_datasets,
                found: remaining,
            });
        }
        Ok(())
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_DATASETS)
    }
}
