//! JetStream round trip against a real NATS server in Docker.
//!
//! Ignored by default. Run with:
//! `cargo test -p pipeline --test nats_jetstream -- --ignored`

mod common;

use std::time::Duration;

use common::init_tracing;
use futures::StreamExt;
use pipeline::{MessageChannel, NatsChannel, NatsSettings};
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{GenericImage, ImageExt};

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_publish_consume_ack_redeliver() {
    init_tracing();

    let container = GenericImage::new("nats", "2.10-alpine")
        .with_exposed_port(4222.tcp())
        .with_wait_for(WaitFor::message_on_stderr("Server is ready"))
        .with_cmd(["-js"])
        .start()
        .await
        .expect("start nats");
    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(4222).await.unwrap();

    let settings = NatsSettings {
        url: format!("nats://{host}:{port}"),
        ack_wait: Duration::from_secs(2),
        ..NatsSettings::default()
    };
    let channel = NatsChannel::connect(settings.clone()).await.unwrap();

    let ack = channel
        .publish("metadata", "/data/2024-01-01/content/batch-0")
        .await
        .unwrap();
    assert!(ack.sequence.is_some());

    // First delivery is dropped without an ack and comes back after ack_wait.
    {
        let mut stream = channel.consume("metadata").await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.payload, "/data/2024-01-01/content/batch-0");
        assert!(!first.redelivered);
    }

    let mut stream = channel.consume("metadata").await.unwrap();
    let again = tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(again.redelivered);
    again.ack().await.unwrap();

    // Acked: nothing else arrives.
    let nothing = tokio::time::timeout(Duration::from_secs(3), stream.next()).await;
    assert!(nothing.is_err());

    channel
        .announce("pipeline.ready.metadata", "{}")
        .await
        .unwrap();
    channel.close().await.unwrap();
}
