//! Shared record of each work date's progress.
//!
//! One marker per date holds the current [`WorkState`] and, once published,
//! the [`Partition`]. Writers replace the marker with write-temp-then-rename,
//! so a concurrent reader sees either the old marker or the new one, never a
//! torn write. Publishing the partition and entering BATCHES_READY happen in
//! the same rename.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   2024-01-01/
//!     state.json      {"date", "state", "partition"?, "updated_at"}
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::partition::Partition;
use crate::work::{WorkDate, WorkState};

pub const MARKER_FILE: &str = "state.json";

/// The persisted marker for one work date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMarker {
    pub date: WorkDate,
    pub state: WorkState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<Partition>,
    pub updated_at: DateTime<Utc>,
}

impl StateMarker {
    pub fn initial(date: WorkDate) -> Self {
        Self {
            date,
            state: WorkState::Init,
            partition: None,
            updated_at: Utc::now(),
        }
    }

    /// Apply an `advance` request. `Ok(None)` means nothing to write.
    fn advanced(&self, requested: WorkState) -> Result<Option<StateMarker>> {
        if requested < self.state {
            return Err(PipelineError::Regression {
                date: self.date,
                current: self.state,
                requested,
            });
        }
        if requested == self.state {
            return Ok(None);
        }
        if requested.requires_partition() && self.partition.is_none() {
            return Err(PipelineError::MissingPartition {
                date: self.date,
                requested,
            });
        }

        Ok(Some(StateMarker {
            state: requested,
            updated_at: Utc::now(),
            ..self.clone()
        }))
    }

    /// Apply a `publish_partition` request. `Ok(None)` means already published.
    fn with_partition(&self, partition: &Partition) -> Result<Option<StateMarker>> {
        match &self.partition {
            Some(existing) if existing == partition => Ok(None),
            Some(_) => Err(PipelineError::PartitionConflict { date: self.date }),
            None => Ok(Some(StateMarker {
                date: self.date,
                state: self.state.max(WorkState::BatchesReady),
                partition: Some(partition.clone()),
                updated_at: Utc::now(),
            })),
        }
    }

    /// The partition, visible only once the marker says BATCHES_READY.
    fn ready_partition(&self) -> Option<Partition> {
        if self.state.requires_partition() {
            self.partition.clone()
        } else {
            None
        }
    }
}

/// Shared, monotonic progress record keyed by work date.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current state; an unknown date reads as [`WorkState::Init`].
    async fn get_status(&self, date: WorkDate) -> Result<WorkState>;

    /// Move the date forward. Same state is a no-op; a lower one is a
    /// [`PipelineError::Regression`] and leaves the marker untouched.
    async fn advance(&self, date: WorkDate, state: WorkState) -> Result<()>;

    /// Record the partition and enter BATCHES_READY in one atomic write.
    async fn publish_partition(&self, date: WorkDate, partition: &Partition) -> Result<()>;

    /// The published partition, or `None` before BATCHES_READY.
    async fn load_partition(&self, date: WorkDate) -> Result<Option<Partition>>;
}

// ============================================================================
// Filesystem store
// ============================================================================

/// State markers on a shared filesystem.
///
/// Exactly one logical writer per date is assumed (the batch-index-0 fetch
/// worker). Readers may be any number of processes on any host that mounts
/// the same root.
#[derive(Debug, Clone)]
pub struct FsStateStore {
    root: PathBuf,
}

impl FsStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn marker_path(&self, date: WorkDate) -> PathBuf {
        self.root.join(date.to_string()).join(MARKER_FILE)
    }

    async fn read_marker(&self, date: WorkDate) -> Result<StateMarker> {
        let path = self.marker_path(date);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StateMarker::initial(date));
            }
            Err(e) => return Err(e.into()),
        };

        let marker: StateMarker =
            serde_json::from_slice(&raw).map_err(|e| PipelineError::CorruptState {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if marker.date != date {
            return Err(PipelineError::CorruptState {
                path,
                reason: format!("marker is for {}", marker.date),
            });
        }

        Ok(marker)
    }

    async fn write_marker(&self, marker: &StateMarker) -> Result<()> {
        let path = self.marker_path(marker.date);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&dir).await?;

        let raw = serde_json::to_vec_pretty(marker)?;
        let tmp_path = dir.join(format!(".{MARKER_FILE}.{}.tmp", Uuid::new_v4()));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&raw).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(date = %marker.date, state = %marker.state, path = %path.display(), "wrote state marker");
        Ok(())
    }
}

#[async_trait]
impl StateStore for FsStateStore {
    async fn get_status(&self, date: WorkDate) -> Result<WorkState> {
        Ok(self.read_marker(date).await?.state)
    }

    async fn advance(&self, date: WorkDate, state: WorkState) -> Result<()> {
        let current = self.read_marker(date).await?;
        match current.advanced(state)? {
            Some(next) => {
                self.write_marker(&next).await?;
                info!(date = %date, from = %current.state, to = %state, "advanced work state");
            }
            None => debug!(date = %date, state = %state, "state already recorded"),
        }
        Ok(())
    }

    async fn publish_partition(&self, date: WorkDate, partition: &Partition) -> Result<()> {
        let current = self.read_marker(date).await?;
        match current.with_partition(partition)? {
            Some(next) => {
                self.write_marker(&next).await?;
                info!(
                    date = %date,
                    num_batches = partition.num_batches,
                    items = partition.item_count(),
                    "published partition"
                );
            }
            None => debug!(date = %date, "partition already published"),
        }
        Ok(())
    }

    async fn load_partition(&self, date: WorkDate) -> Result<Option<Partition>> {
        Ok(self.read_marker(date).await?.ready_partition())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-process store for tests.
///
/// Shares the marker transition rules with [`FsStateStore`] and records every
/// state it has handed out so tests can assert monotonicity.
#[derive(Default)]
pub struct MemoryStateStore {
    markers: RwLock<HashMap<WorkDate, StateMarker>>,
    writes: RwLock<Vec<(WorkDate, WorkState)>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn marker(&self, date: WorkDate) -> StateMarker {
        self.markers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&date)
            .cloned()
            .unwrap_or_else(|| StateMarker::initial(date))
    }

    fn store(&self, marker: StateMarker) {
        self.writes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((marker.date, marker.state));
        self.markers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(marker.date, marker);
    }

    /// Every state written for `date`, in write order.
    pub fn history(&self, date: WorkDate) -> Vec<WorkState> {
        self.writes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(d, _)| *d == date)
            .map(|(_, state)| *state)
            .collect()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_status(&self, date: WorkDate) -> Result<WorkState> {
        Ok(self.marker(date).state)
    }

    async fn advance(&self, date: WorkDate, state: WorkState) -> Result<()> {
        if let Some(next) = self.marker(date).advanced(state)? {
            self.store(next);
        }
        Ok(())
    }

    async fn publish_partition(&self, date: WorkDate, partition: &Partition) -> Result<()> {
        if let Some(next) = self.marker(date).with_partition(partition)? {
            self.store(next);
        }
        Ok(())
    }

    async fn load_partition(&self, date: WorkDate) -> Result<Option<Partition>> {
        Ok(self.marker(date).ready_partition())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::partition;
    use crate::work::WorkItem;

    fn date() -> WorkDate {
        "2024-01-01".parse().unwrap()
    }

    fn sample_partition() -> Partition {
        let items: Vec<_> = (0..5)
            .map(|i| WorkItem::new(format!("id-{i}"), format!("https://example.com/{i}")))
            .collect();
        partition(&items, 2).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_date_reads_init() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStateStore::new(dir.path());

        assert_eq!(store.get_status(date()).await.unwrap(), WorkState::Init);
        assert!(store.load_partition(date()).await.unwrap().is_none());
        assert!(!store.marker_path(date()).exists());
    }

    #[tokio::test]
    async fn test_advance_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStateStore::new(dir.path());

        store.advance(date(), WorkState::RssFetched).await.unwrap();
        store.advance(date(), WorkState::RssFetched).await.unwrap();

        assert_eq!(store.get_status(date()).await.unwrap(), WorkState::RssFetched);
    }

    #[tokio::test]
    async fn test_regression_rejected_and_state_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStateStore::new(dir.path());

        store.publish_partition(date(), &sample_partition()).await.unwrap();
        let err = store.advance(date(), WorkState::RssFetched).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Regression {
                current: WorkState::BatchesReady,
                requested: WorkState::RssFetched,
                ..
            }
        ));
        assert_eq!(store.get_status(date()).await.unwrap(), WorkState::BatchesReady);
    }

    #[tokio::test]
    async fn test_batches_ready_requires_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStateStore::new(dir.path());

        let err = store.advance(date(), WorkState::BatchesReady).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingPartition { .. }));
        assert_eq!(store.get_status(date()).await.unwrap(), WorkState::Init);
    }

    #[tokio::test]
    async fn test_publish_partition_enters_ready_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStateStore::new(dir.path());
        let partition = sample_partition();

        store.advance(date(), WorkState::RssFetched).await.unwrap();
        assert!(store.load_partition(date()).await.unwrap().is_none());

        store.publish_partition(date(), &partition).await.unwrap();

        assert_eq!(store.get_status(date()).await.unwrap(), WorkState::BatchesReady);
        assert_eq!(store.load_partition(date()).await.unwrap(), Some(partition.clone()));

        // Same partition again is a no-op; a different one conflicts.
        store.publish_partition(date(), &partition).await.unwrap();
        let other = crate::partition::partition(&partition.batches[0], 1).unwrap();
        assert!(matches!(
            store.publish_partition(date(), &other).await,
            Err(PipelineError::PartitionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStateStore::new(dir.path());

        store.advance(date(), WorkState::RssFetched).await.unwrap();
        store.publish_partition(date(), &sample_partition()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("2024-01-01"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![MARKER_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_marker_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStateStore::new(dir.path());
        let path = store.marker_path(date());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{\"date\": \"2024-01-01\", \"sta").unwrap();

        assert!(matches!(
            store.get_status(date()).await,
            Err(PipelineError::CorruptState { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_store_records_monotonic_history() {
        let store = MemoryStateStore::new();

        store.advance(date(), WorkState::RssFetched).await.unwrap();
        store.publish_partition(date(), &sample_partition()).await.unwrap();
        assert!(store.advance(date(), WorkState::Init).await.is_err());

        assert_eq!(
            store.history(date()),
            vec![WorkState::RssFetched, WorkState::BatchesReady]
        );
    }
}
