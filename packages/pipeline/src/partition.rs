//! Deterministic split of one day's items into N disjoint batches.
//!
//! Assignment is round-robin by position: item `i` lands in batch `i % n`.
//! The same ordered input and the same `n` always give the same result, so
//! any worker can recompute or verify a stored partition.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::work::WorkItem;

/// Item id → batch index.
pub type BatchMap = BTreeMap<String, usize>;

/// The persisted result of partitioning: the batches plus their map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub num_batches: usize,
    pub batches: Vec<Vec<WorkItem>>,
    pub batch_map: BatchMap,
}

impl Partition {
    /// Items this worker owns, selected through the batch map.
    ///
    /// Order follows the stored batches, so every call yields the same list.
    pub fn share(&self, batch_index: usize) -> Result<Vec<WorkItem>> {
        if batch_index >= self.num_batches {
            return Err(PipelineError::configuration(format!(
                "batch index {batch_index} out of range for {} batches",
                self.num_batches
            )));
        }

        Ok(self
            .batches
            .iter()
            .flatten()
            .filter(|item| self.batch_map.get(&item.id) == Some(&batch_index))
            .cloned()
            .collect())
    }

    pub fn item_count(&self) -> usize {
        self.batch_map.len()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.iter().map(Vec::len).collect()
    }
}

/// Split `items` into `n` balanced batches.
///
/// Items repeating an earlier id are dropped so that the batch map stays a
/// function. Fails on `n == 0` or an empty item list.
pub fn partition(items: &[WorkItem], n: usize) -> Result<Partition> {
    if n == 0 {
        return Err(PipelineError::InvalidPartition(
            "batch count must be positive".into(),
        ));
    }
    if items.is_empty() {
        return Err(PipelineError::InvalidPartition(
            "cannot partition an empty item list".into(),
        ));
    }

    let mut seen = HashSet::with_capacity(items.len());
    let unique: Vec<&WorkItem> = items
        .iter()
        .filter(|item| seen.insert(item.id.as_str()))
        .collect();

    if unique.len() < items.len() {
        warn!(
            dropped = items.len() - unique.len(),
            "dropped items with duplicate ids before partitioning"
        );
    }

    let mut batches: Vec<Vec<WorkItem>> = vec![Vec::new(); n];
    let mut batch_map = BatchMap::new();

    for (position, item) in unique.into_iter().enumerate() {
        let index = position % n;
        batch_map.insert(item.id.clone(), index);
        batches[index].push(item.clone());
    }

    Ok(Partition {
        num_batches: n,
        batches,
        batch_map,
    })
}
