//! Batch consumer: buffer deliveries, finalize once, then ack.
//!
//! # Architecture
//!
//! ```text
//! consume(queue) ──► consume_one(payload) ──► BatchBuffer
//!                          │ Err                   │ full, max wait, stream end
//!                          ▼                       ▼
//!                  skipped (acked with     finalize_batch(items, ctx)
//!                  the batch) or fatal            │
//!                  in strict mode                 ├─ Ok  ─► publish ctx hand-offs
//!                                                 │         ─► ack every delivery
//!                                                 │         ─► clear buffer
//!                                                 └─ Err ─► Fail: keep buffer, no ack,
//!                                                           surface FinalizeError
//!                                                           Quarantine: park payloads,
//!                                                           ack, continue
//! ```
//!
//! Hand-offs recorded during a finalize form an outbox: nothing reaches the
//! next stage unless the finalize succeeded. A delivery is acked only after
//! its batch's hand-offs are published, so a crash anywhere in between means
//! redelivery rather than loss. Stages must tolerate seeing a batch twice.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::channel::{Delivery, DeliveryStream};
use crate::error::{PipelineError, Result};
use crate::runtime::{Stage, StageContext};

// ============================================================================
// Stage behavior
// ============================================================================

/// Stage-specific behavior plugged into [`BatchConsumer`].
#[async_trait]
pub trait BatchStage: Send + Sync {
    /// What one payload turns into.
    type Item: Send + Sync;

    fn name(&self) -> &str;

    /// Called once after connecting.
    async fn setup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Interpret one payload. An error marks the payload malformed.
    async fn consume_one(&mut self, payload: &str) -> anyhow::Result<Self::Item>;

    /// Process a complete batch. Runs once per batch attempt; record
    /// downstream messages with [`FinalizeContext::hand_off`].
    async fn finalize_batch(
        &mut self,
        items: &[Self::Item],
        ctx: &mut FinalizeContext,
    ) -> anyhow::Result<()>;
}

// ============================================================================
// Finalize context (outbox)
// ============================================================================

/// A message to publish once the batch has been finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandOff {
    pub queue: String,
    pub payload: String,
}

/// Collects a finalize's side effects on the pipeline.
#[derive(Debug)]
pub struct FinalizeContext {
    stage: String,
    strict: bool,
    hand_offs: Vec<HandOff>,
    skipped: Vec<PipelineError>,
}

impl FinalizeContext {
    pub fn new(stage: impl Into<String>, strict: bool) -> Self {
        Self {
            stage: stage.into(),
            strict,
            hand_offs: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Pass `path` to `queue` after this finalize succeeds.
    pub fn hand_off(&mut self, queue: impl Into<String>, path: impl AsRef<Path>) {
        self.hand_offs.push(HandOff {
            queue: queue.into(),
            payload: path.as_ref().to_string_lossy().into_owned(),
        });
    }

    /// Record an artifact that could not be interpreted. Skips it normally;
    /// in strict mode the error is returned so the finalize fails.
    pub fn skip_malformed(&mut self, err: PipelineError) -> Result<()> {
        if self.strict {
            return Err(err);
        }
        warn!(stage = %self.stage, error = %err, "skipping malformed artifact");
        self.skipped.push(err);
        Ok(())
    }

    pub fn hand_offs(&self) -> &[HandOff] {
        &self.hand_offs
    }

    pub fn skipped(&self) -> usize {
        self.skipped.len()
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }
}

// ============================================================================
// Buffer
// ============================================================================

/// Deliveries of the batch in progress, with the items parsed from them.
///
/// Malformed deliveries carry no item but still count toward the batch and
/// are acknowledged with it.
pub struct BatchBuffer<T> {
    capacity: usize,
    items: Vec<T>,
    deliveries: Vec<Delivery>,
}

impl<T> BatchBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Vec::with_capacity(capacity),
            deliveries: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: T, delivery: Delivery) {
        self.items.push(item);
        self.deliveries.push(delivery);
    }

    pub fn push_skipped(&mut self, delivery: Delivery) {
        self.deliveries.push(delivery);
    }

    pub fn is_full(&self) -> bool {
        self.deliveries.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Deliveries buffered, malformed ones included.
    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn payloads(&self) -> impl Iterator<Item = &str> {
        self.deliveries.iter().map(|d| d.payload.as_str())
    }

    /// Empty the buffer, returning the deliveries for acking.
    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        self.items.clear();
        std::mem::take(&mut self.deliveries)
    }

    /// Drop everything without acking; the broker redelivers.
    pub fn clear(&mut self) {
        self.items.clear();
        self.deliveries.clear();
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// What to do when `finalize_batch` fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeFailurePolicy {
    /// Leave the batch unacked and stop the worker.
    Fail,
    /// Publish the batch's payloads to `queue`, ack them, and continue.
    Quarantine { queue: String },
}

/// Consumer options.
#[derive(Debug, Clone)]
pub struct BatchConsumerConfig {
    pub queue: String,
    /// Deliveries per batch.
    pub batch_size: usize,
    /// Treat malformed payloads as fatal.
    pub strict: bool,
    pub on_finalize_failure: FinalizeFailurePolicy,
    /// Used to reopen the consume stream after a connection drop.
    pub reconnect: Backoff,
    /// Longest a partial batch waits for more deliveries before it is
    /// finalized anyway. Keep well below the broker's ack wait.
    pub max_wait: Duration,
}

impl BatchConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            batch_size: 1,
            strict: false,
            on_finalize_failure: FinalizeFailurePolicy::Fail,
            reconnect: Backoff::default(),
            max_wait: Duration::from_secs(60),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_quarantine(mut self, queue: impl Into<String>) -> Self {
        self.on_finalize_failure = FinalizeFailurePolicy::Quarantine {
            queue: queue.into(),
        };
        self
    }

    pub fn with_reconnect(mut self, reconnect: Backoff) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

/// Runs a [`BatchStage`] against a queue.
pub struct BatchConsumer<S: BatchStage> {
    stage: S,
    config: BatchConsumerConfig,
    buffer: BatchBuffer<S::Item>,
}

impl<S: BatchStage> BatchConsumer<S> {
    pub fn new(stage: S, config: BatchConsumerConfig) -> Self {
        let buffer = BatchBuffer::new(config.batch_size);
        Self {
            stage,
            config,
            buffer,
        }
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    async fn open(&self, ctx: &StageContext) -> Result<DeliveryStream> {
        let queue = self.config.queue.as_str();
        self.config
            .reconnect
            .retry("open consumer", || ctx.channel.consume(queue))
            .await
            .map_err(|(attempts, source)| {
                if source.is_connection() {
                    PipelineError::Connection { attempts, source }
                } else {
                    PipelineError::Channel(source)
                }
            })
    }

    async fn accept(&mut self, delivery: Delivery) -> Result<()> {
        match self.stage.consume_one(&delivery.payload).await {
            Ok(item) => {
                debug!(queue = %delivery.queue, payload = %delivery.payload, redelivered = delivery.redelivered, "buffered");
                self.buffer.push(item, delivery);
            }
            Err(e) => {
                let err = PipelineError::malformed(delivery.payload.as_str(), format!("{e:#}"));
                if self.config.strict {
                    return Err(err);
                }
                warn!(queue = %delivery.queue, error = %err, "skipping malformed payload");
                self.buffer.push_skipped(delivery);
            }
        }
        Ok(())
    }

    async fn flush(&mut self, ctx: &StageContext) -> Result<()> {
        let stage_name = self.stage.name().to_string();
        let mut out = FinalizeContext::new(stage_name.as_str(), self.config.strict);

        if !self.buffer.items().is_empty() {
            if let Err(source) = self.stage.finalize_batch(self.buffer.items(), &mut out).await {
                return self.on_finalize_failure(source, ctx).await;
            }
        }

        for hand_off in out.hand_offs() {
            ctx.channel
                .publish(&hand_off.queue, &hand_off.payload)
                .await?;
            debug!(queue = %hand_off.queue, payload = %hand_off.payload, "handed off");
        }

        let items = self.buffer.items().len();
        let deliveries = self.buffer.take_deliveries();
        let acked = deliveries.len();
        for delivery in deliveries {
            delivery.ack().await?;
        }

        info!(
            stage = %stage_name,
            items,
            acked,
            skipped = acked - items + out.skipped(),
            hand_offs = out.hand_offs().len(),
            "batch finalized"
        );
        Ok(())
    }

    async fn on_finalize_failure(
        &mut self,
        source: anyhow::Error,
        ctx: &StageContext,
    ) -> Result<()> {
        let stage = self.stage.name().to_string();

        match self.config.on_finalize_failure.clone() {
            FinalizeFailurePolicy::Fail => {
                error!(
                    stage = %stage,
                    pending = self.buffer.len(),
                    error = %format_args!("{source:#}"),
                    "finalize failed, leaving batch unacknowledged"
                );
                Err(PipelineError::Finalize { stage, source })
            }
            FinalizeFailurePolicy::Quarantine { queue } => {
                warn!(
                    stage = %stage,
                    quarantine = %queue,
                    pending = self.buffer.len(),
                    error = %format_args!("{source:#}"),
                    "finalize failed, quarantining batch"
                );
                let payloads: Vec<String> = self.buffer.payloads().map(str::to_owned).collect();
                for payload in &payloads {
                    ctx.channel.publish(&queue, payload).await?;
                }
                for delivery in self.buffer.take_deliveries() {
                    delivery.ack().await?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<S: BatchStage> Stage for BatchConsumer<S> {
    fn name(&self) -> &str {
        self.stage.name()
    }

    fn validate(&self) -> Result<()> {
        if self.config.queue.trim().is_empty() {
            return Err(PipelineError::configuration("consumer queue name is empty"));
        }
        if self.config.batch_size == 0 {
            return Err(PipelineError::configuration("--batch-size must be at least 1"));
        }
        if self.config.max_wait.is_zero() {
            return Err(PipelineError::configuration("batch max wait must be positive"));
        }
        if let FinalizeFailurePolicy::Quarantine { queue } = &self.config.on_finalize_failure {
            if queue == &self.config.queue {
                return Err(PipelineError::configuration(
                    "quarantine queue must differ from the consumed queue",
                ));
            }
        }
        Ok(())
    }

    async fn setup(&mut self, _ctx: &StageContext) -> Result<()> {
        let stage = self.stage.name().to_string();
        self.stage
            .setup()
            .await
            .map_err(|source| PipelineError::Stage { stage, source })
    }

    async fn run(&mut self, ctx: &StageContext) -> Result<()> {
        let mut stream = self.open(ctx).await?;
        info!(
            queue = %self.config.queue,
            batch_size = self.config.batch_size,
            strict = self.config.strict,
            "consuming"
        );

        // Set while a partial batch is buffered.
        let mut deadline: Option<Instant> = None;

        loop {
            if self.buffer.is_empty() {
                deadline = None;
            } else if deadline.is_none() {
                deadline = Some(Instant::now() + self.config.max_wait);
            }
            let linger = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let next = tokio::select! {
                _ = ctx.shutdown.cancelled() => {
                    if !self.buffer.is_empty() {
                        info!(
                            pending = self.buffer.len(),
                            "leaving partial batch unacknowledged for redelivery"
                        );
                    }
                    self.buffer.clear();
                    return Ok(());
                }
                _ = linger => {
                    debug!(
                        queue = %self.config.queue,
                        pending = self.buffer.len(),
                        "max wait reached, finalizing partial batch"
                    );
                    self.flush(ctx).await?;
                    continue;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.accept(delivery).await?;
                    if self.buffer.is_full() {
                        self.flush(ctx).await?;
                    }
                }
                Some(Err(e)) if e.is_connection() => {
                    warn!(
                        queue = %self.config.queue,
                        error = %e,
                        discarded = self.buffer.len(),
                        "consume stream lost, reconnecting"
                    );
                    self.buffer.clear();
                    stream = self.open(ctx).await?;
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    if !self.buffer.is_empty() {
                        self.flush(ctx).await?;
                    }
                    info!(queue = %self.config.queue, "consume stream ended");
                    return Ok(());
                }
            }
        }
    }
}
