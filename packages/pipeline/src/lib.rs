//! Multi-stage worker coordination for the story pipeline.
//!
//! Stages never share memory. They talk through a durable queue
//! ([`MessageChannel`]) and a shared filesystem, where a per-date state marker
//! ([`StateStore`]) coordinates the parallel fetch workers.
//!
//! # Architecture
//!
//! ```text
//! fetch[0..N) ──► metadata ──► index ──► archive
//!     │              │           │          │
//!     │   folder path messages over the queue (StageChain)
//!     │
//!     └── StateStore: INIT → RSS_FETCHED → BATCHES_READY (+ partition)
//! ```
//!
//! - [`ReadinessLatch`] runs the batch-partition protocol for fetch workers.
//! - [`WorkerRuntime`] owns the process lifecycle of any [`Stage`].
//! - [`BatchConsumer`] turns a [`BatchStage`] into a queue-driven stage that
//!   finalizes each batch once and acks only after success.

pub mod backoff;
pub mod channel;
pub mod consumer;
pub mod error;
pub mod partition;
pub mod readiness;
pub mod runtime;
pub mod state_store;
pub mod work;

pub use backoff::Backoff;
pub use channel::{
    readiness_subject, ChannelConnector, Delivery, MessageChannel, NatsChannel, NatsConnector,
    NatsSettings, PublishAck,
};
pub use consumer::{
    BatchBuffer, BatchConsumer, BatchConsumerConfig, BatchStage, FinalizeContext,
    FinalizeFailurePolicy, HandOff,
};
pub use error::{ChannelError, ErrorClass, PipelineError, Result};
pub use partition::{partition, BatchMap, Partition};
pub use readiness::{BatchSlot, ItemSource, ReadinessConfig, ReadinessLatch};
pub use runtime::{RuntimeConfig, RuntimeState, Stage, StageContext, WorkerRuntime};
pub use state_store::{FsStateStore, StateStore};
pub use work::{WorkDate, WorkItem, WorkState};

/// In-process doubles for the broker and the state store.
pub mod testing {
    pub use crate::channel::{MemoryChannel, MemoryConnector, PublishedMessage};
    pub use crate::state_store::MemoryStateStore;
}
