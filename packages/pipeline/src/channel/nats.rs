//! NATS JetStream channel.
//!
//! One work-queue stream holds every stage queue:
//!
//! ```text
//! stream PIPELINE  subjects: <prefix>.queue.>
//!   <prefix>.queue.metadata   durable pull consumer "metadata"
//!   <prefix>.queue.index      durable pull consumer "index"
//!   <prefix>.queue.archive    durable pull consumer "archive"
//! ```
//!
//! Parallel instances of one stage bind the same durable consumer, so the
//! broker splits deliveries between them. Acks are explicit; a delivery not
//! acked within `ack_wait` is redelivered.
//!
//! Readiness announcements go over core NATS on `<prefix>.ready.<stage>`,
//! outside the stream, and are not persisted.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::context::{GetStreamError, GetStreamErrorKind};
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, stream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info};

use super::{
    AckHandle, ChannelConnector, Delivery, DeliveryStream, MessageChannel, PublishAck,
};
use crate::error::ChannelError;

/// Connection and stream settings.
#[derive(Debug, Clone)]
pub struct NatsSettings {
    pub url: String,
    pub stream: String,
    pub prefix: String,
    /// How long the broker waits for an ack before redelivering.
    pub ack_wait: Duration,
    pub connection_timeout: Duration,
    /// Name reported to the server for this client.
    pub client_name: String,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream: "PIPELINE".to_string(),
            prefix: "pipeline".to_string(),
            ack_wait: Duration::from_secs(30 * 60),
            connection_timeout: Duration::from_secs(5),
            client_name: "pipeline-worker".to_string(),
        }
    }
}

impl NatsSettings {
    pub fn subject(&self, queue: &str) -> String {
        format!("{}.queue.{queue}", self.prefix)
    }

    fn stream_subjects(&self) -> String {
        format!("{}.queue.>", self.prefix)
    }
}

/// Queue names become subject tokens and durable consumer names.
fn validate_queue(queue: &str) -> Result<(), ChannelError> {
    let valid = !queue.is_empty()
        && queue
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ChannelError::Consumer {
            queue: queue.to_string(),
            reason: "queue names may only contain ASCII letters, digits, '-' and '_'".into(),
        })
    }
}

fn connection_error(e: impl std::fmt::Display) -> ChannelError {
    ChannelError::Connection(e.to_string())
}

/// Only transport failures are worth reconnecting for; a rejected stream
/// lookup will be rejected again.
fn stream_lookup_error(queue: &str, e: GetStreamError) -> ChannelError {
    match e.kind() {
        GetStreamErrorKind::Request => connection_error(e),
        _ => ChannelError::Consumer {
            queue: queue.to_string(),
            reason: e.to_string(),
        },
    }
}

fn consumer_setup_error(queue: &str, e: stream::ConsumerError) -> ChannelError {
    match e.kind() {
        stream::ConsumerErrorKind::Request | stream::ConsumerErrorKind::TimedOut => {
            connection_error(e)
        }
        _ => ChannelError::Consumer {
            queue: queue.to_string(),
            reason: e.to_string(),
        },
    }
}

/// Opens JetStream channels and makes sure the stream exists.
pub struct NatsConnector {
    settings: NatsSettings,
}

impl NatsConnector {
    pub fn new(settings: NatsSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ChannelConnector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageChannel>, ChannelError> {
        let channel = NatsChannel::connect(self.settings.clone()).await?;
        Ok(Arc::new(channel))
    }
}

/// [`MessageChannel`] backed by a JetStream work-queue stream.
pub struct NatsChannel {
    client: async_nats::Client,
    context: jetstream::Context,
    settings: NatsSettings,
}

impl NatsChannel {
    pub async fn connect(settings: NatsSettings) -> Result<Self, ChannelError> {
        let client = async_nats::ConnectOptions::new()
            .name(&settings.client_name)
            .connection_timeout(settings.connection_timeout)
            .connect(settings.url.as_str())
            .await
            .map_err(connection_error)?;

        let context = jetstream::new(client.clone());
        context
            .get_or_create_stream(stream::Config {
                name: settings.stream.clone(),
                subjects: vec![settings.stream_subjects()],
                retention: stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(connection_error)?;

        info!(url = %settings.url, stream = %settings.stream, "connected to NATS JetStream");

        Ok(Self {
            client,
            context,
            settings,
        })
    }
}

struct NatsAck(jetstream::Message);

#[async_trait]
impl AckHandle for NatsAck {
    async fn ack(self: Box<Self>) -> Result<(), ChannelError> {
        self.0
            .ack()
            .await
            .map_err(|e| ChannelError::Ack(e.to_string()))
    }
}

#[async_trait]
impl MessageChannel for NatsChannel {
    async fn publish(&self, queue: &str, payload: &str) -> Result<PublishAck, ChannelError> {
        validate_queue(queue)?;
        let subject = self.settings.subject(queue);

        let ack = self
            .context
            .publish(subject.clone(), Bytes::from(payload.to_owned()))
            .await
            .map_err(connection_error)?
            .await
            .map_err(|e| ChannelError::Publish {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        debug!(subject = %subject, sequence = ack.sequence, "published");
        Ok(PublishAck {
            queue: queue.to_string(),
            sequence: Some(ack.sequence),
        })
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, ChannelError> {
        validate_queue(queue)?;

        let stream = self
            .context
            .get_stream(&self.settings.stream)
            .await
            .map_err(|e| stream_lookup_error(queue, e))?;

        let consumer: jetstream::consumer::PullConsumer = stream
            .get_or_create_consumer(
                queue,
                pull::Config {
                    durable_name: Some(queue.to_string()),
                    filter_subject: self.settings.subject(queue),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.settings.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| consumer_setup_error(queue, e))?;

        let messages = consumer.messages().await.map_err(connection_error)?;
        let queue = queue.to_string();

        let deliveries = messages.map(move |result| match result {
            Ok(message) => {
                let payload = String::from_utf8_lossy(&message.payload).into_owned();
                let redelivered = message
                    .info()
                    .map(|info| info.delivered > 1)
                    .unwrap_or(false);
                Ok(Delivery::new(
                    queue.clone(),
                    payload,
                    redelivered,
                    Box::new(NatsAck(message)),
                ))
            }
            Err(e) => Err(connection_error(e)),
        });

        Ok(deliveries.boxed())
    }

    async fn announce(&self, subject: &str, payload: &str) -> Result<(), ChannelError> {
        self.client
            .publish(subject.to_string(), Bytes::from(payload.to_owned()))
            .await
            .map_err(connection_error)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.client.flush().await.map_err(connection_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_live_under_prefix() {
        let settings = NatsSettings::default();
        assert_eq!(settings.subject("metadata"), "pipeline.queue.metadata");
        assert_eq!(settings.stream_subjects(), "pipeline.queue.>");
    }

    #[test]
    fn test_queue_names_are_single_tokens() {
        assert!(validate_queue("metadata").is_ok());
        assert!(validate_queue("index-quarantine").is_ok());
        assert!(validate_queue("").is_err());
        assert!(validate_queue("a.b").is_err());
        assert!(validate_queue("a>").is_err());
    }

    #[test]
    fn test_rejected_consumer_setup_is_not_a_connection_error() {
        let missing = stream_lookup_error(
            "metadata",
            GetStreamError::from(GetStreamErrorKind::InvalidStreamName),
        );
        assert!(!missing.is_connection());
        assert!(matches!(missing, ChannelError::Consumer { ref queue, .. } if queue == "metadata"));

        let invalid = consumer_setup_error(
            "metadata",
            stream::ConsumerError::from(stream::ConsumerErrorKind::InvalidConsumerType),
        );
        assert!(!invalid.is_connection());
        assert_eq!(
            crate::PipelineError::Channel(invalid).class(),
            crate::ErrorClass::Stage
        );
    }

    #[test]
    fn test_transport_failures_during_setup_stay_retryable() {
        let lookup = stream_lookup_error(
            "metadata",
            GetStreamError::from(GetStreamErrorKind::Request),
        );
        assert!(lookup.is_connection());

        let timeout = consumer_setup_error(
            "metadata",
            stream::ConsumerError::from(stream::ConsumerErrorKind::TimedOut),
        );
        assert!(timeout.is_connection());
    }
}
