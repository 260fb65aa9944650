//! Message channel abstraction over a durable, at-least-once queue.
//!
//! Provides a trait-based channel so stages run unchanged against NATS
//! JetStream in production and [`MemoryChannel`] in tests.
//!
//! # Delivery contract
//!
//! - `publish` returns once the broker has accepted the payload.
//! - `consume` yields [`Delivery`] values lazily, in publish order per queue.
//! - A delivery that is never acked is redelivered after a consumer crash or
//!   a connection loss; nothing is lost while unacknowledged.
//! - Acking is explicit and deferred to the caller (the batch consumer acks
//!   only after a successful finalize).

mod memory;
mod nats;

pub use memory::{MemoryChannel, MemoryConnector, PublishedMessage};
pub use nats::{NatsChannel, NatsConnector, NatsSettings};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ChannelError;

/// Broker acknowledgement for a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub queue: String,
    /// Broker sequence number, when the broker exposes one.
    pub sequence: Option<u64>,
}

/// Handle that settles one delivery.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), ChannelError>;
}

/// One message received from a queue, plus the means to acknowledge it.
pub struct Delivery {
    pub queue: String,
    pub payload: String,
    /// True if the broker reports this is not the first delivery.
    pub redelivered: bool,
    handle: Box<dyn AckHandle>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        payload: impl Into<String>,
        redelivered: bool,
        handle: Box<dyn AckHandle>,
    ) -> Self {
        Self {
            queue: queue.into(),
            payload: payload.into(),
            redelivered,
            handle,
        }
    }

    /// Acknowledge the delivery; the broker will not redeliver it.
    pub async fn ack(self) -> Result<(), ChannelError> {
        self.handle.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("payload", &self.payload)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, ChannelError>>;

/// Durable queue operations used by workers.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Publish a payload onto a named queue.
    async fn publish(&self, queue: &str, payload: &str) -> Result<PublishAck, ChannelError>;

    /// Open a lazy stream of deliveries from a named queue.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, ChannelError>;

    /// Fire-and-forget notification, not persisted (readiness signals).
    async fn announce(&self, subject: &str, payload: &str) -> Result<(), ChannelError>;

    /// Flush and release the connection.
    async fn close(&self) -> Result<(), ChannelError>;
}

/// Opens channel connections; the runtime retries it with backoff.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn MessageChannel>, ChannelError>;
}

/// Subject carrying readiness signals for a stage.
pub fn readiness_subject(prefix: &str, stage: &str) -> String {
    format!("{prefix}.ready.{stage}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_subject() {
        assert_eq!(readiness_subject("pipeline", "metadata"), "pipeline.ready.metadata");
    }
}
