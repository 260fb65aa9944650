//! Batch-partition readiness protocol.
//!
//! N fetch workers split one day's feed without a lock. Batch index 0 is the
//! only writer; every other index waits on the shared state marker.
//!
//! # Architecture
//!
//! ```text
//! index 0 (leader)                        index k > 0 (follower)
//!     │                                       │
//!     ├─► partition already stored? reuse     ├─► sleep startup_delay
//!     ├─► ItemSource::load_items              ├─► poll get_status every poll_interval
//!     ├─► advance(RSS_FETCHED)                │       (never reads the partition
//!     ├─► partition(items, n)                 │        before BATCHES_READY)
//!     └─► publish_partition ──── state.json ──┴─► load_partition
//!              (partition + BATCHES_READY,
//!               one atomic rename)
//!
//! every worker: partition.share(batch_index)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::partition::{partition, Partition};
use crate::state_store::StateStore;
use crate::work::{WorkDate, WorkItem, WorkState};

/// Supplies the full, ordered item list for a date. Only the leader calls it.
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn load_items(&self, date: WorkDate) -> anyhow::Result<Vec<WorkItem>>;
}

/// Timing for followers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// Initial wait before the first poll.
    pub startup_delay: Duration,
    pub poll_interval: Duration,
    /// Give up with [`PipelineError::ReadinessTimeout`] after this long.
    pub max_wait: Option<Duration>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(10),
            max_wait: None,
        }
    }
}

/// Where one fetch worker sits in the day's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSlot {
    pub date: WorkDate,
    pub num_batches: usize,
    pub batch_index: usize,
}

impl BatchSlot {
    pub fn new(date: WorkDate, num_batches: usize, batch_index: usize) -> Result<Self> {
        if num_batches == 0 {
            return Err(PipelineError::configuration("--num-batches must be at least 1"));
        }
        if batch_index >= num_batches {
            return Err(PipelineError::configuration(format!(
                "--batch-index {batch_index} must be below --num-batches {num_batches}"
            )));
        }
        Ok(Self {
            date,
            num_batches,
            batch_index,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.batch_index == 0
    }
}

/// Resolves a worker's share of the day's items.
pub struct ReadinessLatch {
    store: Arc<dyn StateStore>,
    config: ReadinessConfig,
}

impl ReadinessLatch {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            config: ReadinessConfig::default(),
        }
    }

    pub fn with_config(store: Arc<dyn StateStore>, config: ReadinessConfig) -> Self {
        Self { store, config }
    }

    /// Wait for (or build) the partition and return this slot's items.
    pub async fn acquire(
        &self,
        slot: BatchSlot,
        source: &dyn ItemSource,
        shutdown: &CancellationToken,
    ) -> Result<Vec<WorkItem>> {
        let partition = if slot.is_leader() {
            self.lead(slot, source).await?
        } else {
            self.follow(slot.date, shutdown).await?
        };

        if partition.num_batches != slot.num_batches {
            return Err(PipelineError::configuration(format!(
                "stored partition for {} has {} batches, this worker expects {}",
                slot.date, partition.num_batches, slot.num_batches
            )));
        }

        let share = partition.share(slot.batch_index)?;
        info!(
            date = %slot.date,
            batch_index = slot.batch_index,
            num_batches = slot.num_batches,
            items = share.len(),
            "resolved batch share"
        );
        Ok(share)
    }

    async fn lead(&self, slot: BatchSlot, source: &dyn ItemSource) -> Result<Partition> {
        if let Some(existing) = self.store.load_partition(slot.date).await? {
            info!(date = %slot.date, "partition already published, reusing it");
            return Ok(existing);
        }

        let items = source
            .load_items(slot.date)
            .await
            .map_err(|source| PipelineError::Stage {
                stage: "item-source".into(),
                source,
            })?;
        info!(date = %slot.date, items = items.len(), "loaded source items");

        self.store.advance(slot.date, WorkState::RssFetched).await?;

        let partition = partition(&items, slot.num_batches)?;
        self.store.publish_partition(slot.date, &partition).await?;

        Ok(partition)
    }

    async fn follow(&self, date: WorkDate, shutdown: &CancellationToken) -> Result<Partition> {
        let started = Instant::now();
        let deadline = self.config.max_wait.map(|max| started + max);

        sleep_or_cancel(self.config.startup_delay, shutdown).await?;

        let mut last_seen = WorkState::Init;
        loop {
            let state = self.store.get_status(date).await?;
            if state < last_seen {
                return Err(PipelineError::Regression {
                    date,
                    current: last_seen,
                    requested: state,
                });
            }
            last_seen = state;

            if state.requires_partition() {
                return match self.store.load_partition(date).await? {
                    Some(partition) => {
                        debug!(
                            date = %date,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "batches ready"
                        );
                        Ok(partition)
                    }
                    None => Err(PipelineError::MissingPartition {
                        date,
                        requested: state,
                    }),
                };
            }

            let mut wait = self.config.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(PipelineError::ReadinessTimeout { date, last_seen });
                }
                wait = wait.min(deadline - now);
            }

            debug!(date = %date, state = %state, "waiting for BATCHES_READY");
            sleep_or_cancel(wait, shutdown).await?;
        }
    }
}

async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = shutdown.cancelled() => Err(PipelineError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
