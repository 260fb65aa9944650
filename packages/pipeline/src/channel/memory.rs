//! In-memory channel that behaves like an at-least-once broker.
//!
//! Tests inspect what was published and acknowledged, simulate a consumer
//! crash with [`MemoryChannel::redeliver_unacked`], and inject connection
//! drops without a real broker.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{
    AckHandle, ChannelConnector, Delivery, DeliveryStream, MessageChannel, PublishAck,
};
use crate::error::ChannelError;

/// A message recorded by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: String,
}

#[derive(Debug, Clone)]
struct Pending {
    id: u64,
    payload: String,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    in_flight: BTreeMap<u64, Pending>,
    acked: Vec<String>,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    published: Mutex<Vec<PublishedMessage>>,
    announced: Mutex<Vec<PublishedMessage>>,
    notify: Notify,
    sealed: AtomicBool,
    next_id: AtomicU64,
    pending_drops: AtomicU32,
    failing_publishes: AtomicU32,
    close_calls: AtomicU32,
}

impl Inner {
    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        f(queues.entry(queue.to_string()).or_default())
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn next_delivery(&self, queue: &str) -> Option<Pending> {
        self.with_queue(queue, |state| {
            let mut pending = state.ready.pop_front()?;
            pending.deliveries += 1;
            state.in_flight.insert(pending.id, pending.clone());
            Some(pending)
        })
    }

    fn requeue_in_flight(&self) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        for state in queues.values_mut() {
            let in_flight = std::mem::take(&mut state.in_flight);
            for (_, pending) in in_flight.into_iter().rev() {
                state.ready.push_front(pending);
            }
        }
    }
}

/// Shared in-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    inner: Arc<Inner>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop waiting for new messages: consumer streams end once their queue
    /// has no ready messages left. Publishing still works.
    pub fn seal(&self) {
        self.inner.sealed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Put every unacknowledged delivery back at the head of its queue, as a
    /// broker does after a consumer crash.
    pub fn redeliver_unacked(&self) {
        self.inner.requeue_in_flight();
        self.inner.notify.notify_waiters();
    }

    /// Make the next poll of any consumer stream fail with a connection
    /// error; unacknowledged deliveries go back to their queues.
    pub fn drop_connection(&self) {
        self.inner.pending_drops.fetch_add(1, Ordering::SeqCst);
        self.inner.requeue_in_flight();
        self.inner.notify.notify_waiters();
    }

    /// Fail the next `count` publishes with a connection error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.failing_publishes.fetch_add(count, Ordering::SeqCst);
    }

    /// Get all published messages.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Payloads published to one queue, in order.
    pub fn published_to(&self, queue: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|m| m.queue == queue)
            .map(|m| m.payload)
            .collect()
    }

    /// Readiness and other announcements.
    pub fn announcements(&self) -> Vec<PublishedMessage> {
        self.inner
            .announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Payloads acknowledged on one queue, in ack order.
    pub fn acked(&self, queue: &str) -> Vec<String> {
        self.inner.with_queue(queue, |state| state.acked.clone())
    }

    pub fn in_flight_count(&self, queue: &str) -> usize {
        self.inner.with_queue(queue, |state| state.in_flight.len())
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner.with_queue(queue, |state| state.ready.len())
    }

    pub fn close_calls(&self) -> u32 {
        self.inner.close_calls.load(Ordering::SeqCst)
    }
}

struct MemoryAck {
    inner: Arc<Inner>,
    queue: String,
    id: u64,
    delivery: u32,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), ChannelError> {
        self.inner.with_queue(&self.queue, |state| {
            let current = state
                .in_flight
                .get(&self.id)
                .is_some_and(|pending| pending.deliveries == self.delivery);

            match current.then(|| state.in_flight.remove(&self.id)).flatten() {
                Some(pending) => {
                    state.acked.push(pending.payload);
                    Ok(())
                }
                None => Err(ChannelError::Ack(format!(
                    "delivery {} on {} is no longer in flight",
                    self.id, self.queue
                ))),
            }
        })
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn publish(&self, queue: &str, payload: &str) -> Result<PublishAck, ChannelError> {
        if Inner::take_one(&self.inner.failing_publishes) {
            return Err(ChannelError::Connection("injected publish failure".into()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.with_queue(queue, |state| {
            state.ready.push_back(Pending {
                id,
                payload: payload.to_string(),
                deliveries: 0,
            });
        });
        self.inner
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage {
                queue: queue.to_string(),
                payload: payload.to_string(),
            });
        self.inner.notify.notify_waiters();

        Ok(PublishAck {
            queue: queue.to_string(),
            sequence: Some(id),
        })
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, ChannelError> {
        let inner = self.inner.clone();
        let queue = queue.to_string();

        let stream = async_stream::stream! {
            loop {
                let notified = inner.notify.notified();

                if Inner::take_one(&inner.pending_drops) {
                    yield Err(ChannelError::Connection("injected connection drop".into()));
                    break;
                }

                if let Some(pending) = inner.next_delivery(&queue) {
                    let handle = MemoryAck {
                        inner: inner.clone(),
                        queue: queue.clone(),
                        id: pending.id,
                        delivery: pending.deliveries,
                    };
                    yield Ok(Delivery::new(
                        queue.clone(),
                        pending.payload,
                        pending.deliveries > 1,
                        Box::new(handle),
                    ));
                    continue;
                }

                if inner.sealed.load(Ordering::SeqCst) {
                    break;
                }

                notified.await;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn announce(&self, subject: &str, payload: &str) -> Result<(), ChannelError> {
        self.inner
            .announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage {
                queue: subject.to_string(),
                payload: payload.to_string(),
            });
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out a shared [`MemoryChannel`], optionally failing the
/// first few attempts.
pub struct MemoryConnector {
    channel: MemoryChannel,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl MemoryConnector {
    pub fn new(channel: MemoryChannel) -> Self {
        Self {
            channel,
            failures_left: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    /// Refuse the first `count` connection attempts.
    pub fn failing_first(self, count: u32) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageChannel>, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if Inner::take_one(&self.failures_left) {
            return Err(ChannelError::Connection("connection refused".into()));
        }
        Ok(Arc::new(self.channel.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_publish_then_consume_in_order() {
        let channel = MemoryChannel::new();
        channel.publish("metadata", "/data/a").await.unwrap();
        channel.publish("metadata", "/data/b").await.unwrap();
        channel.seal();

        let deliveries: Vec<_> = channel
            .consume("metadata")
            .await
            .unwrap()
            .map(|d| d.unwrap().payload)
            .collect()
            .await;

        assert_eq!(deliveries, vec!["/data/a", "/data/b"]);
        assert_eq!(channel.in_flight_count("metadata"), 2);
    }

    #[tokio::test]
    async fn test_ack_settles_delivery() {
        let channel = MemoryChannel::new();
        channel.publish("index", "/data/a").await.unwrap();
        channel.seal();

        let mut stream = channel.consume("index").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(!delivery.redelivered);
        delivery.ack().await.unwrap();

        assert_eq!(channel.acked("index"), vec!["/data/a"]);
        assert_eq!(channel.in_flight_count("index"), 0);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unacked_deliveries_are_redelivered() {
        let channel = MemoryChannel::new();
        channel.publish("archive", "/data/a").await.unwrap();
        channel.publish("archive", "/data/b").await.unwrap();
        channel.seal();

        let mut first = channel.consume("archive").await.unwrap();
        let stale = first.next().await.unwrap().unwrap();
        drop(first);

        channel.redeliver_unacked();

        let payloads: Vec<_> = channel
            .consume("archive")
            .await
            .unwrap()
            .map(|d| {
                let d = d.unwrap();
                (d.payload.clone(), d.redelivered)
            })
            .collect()
            .await;
        assert_eq!(
            payloads,
            vec![("/data/a".to_string(), true), ("/data/b".to_string(), false)]
        );

        // The handle from before the crash no longer settles anything.
        assert!(stale.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_connection_drop_yields_error() {
        let channel = MemoryChannel::new();
        channel.publish("metadata", "/data/a").await.unwrap();

        let mut stream = channel.consume("metadata").await.unwrap();
        let _held = stream.next().await.unwrap().unwrap();
        channel.drop_connection();

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_connection());
        assert_eq!(channel.ready_count("metadata"), 1);
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_publish() {
        let channel = MemoryChannel::new();
        let mut stream = channel.consume("metadata").await.unwrap();

        let publisher = channel.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish("metadata", "/data/late").await.unwrap();
        });

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload, "/data/late");
    }

    #[tokio::test]
    async fn test_connector_fails_first_attempts() {
        let connector = MemoryConnector::new(MemoryChannel::new()).failing_first(2);

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }
}
