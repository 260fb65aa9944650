//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use pipeline::{ItemSource, WorkDate, WorkItem};

/// Install a test-writer subscriber once. Run with
/// `RUST_LOG=debug cargo test -- --nocapture` to see worker logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn date() -> WorkDate {
    "2024-01-01".parse().expect("valid date")
}

pub fn items(count: usize) -> Vec<WorkItem> {
    (0..count)
        .map(|i| {
            WorkItem::new(format!("story-{i}"), format!("https://news.example.com/{i}"))
                .with_title(format!("Story {i}"))
        })
        .collect()
}

/// Item source returning a fixed list and counting calls.
pub struct FixedSource {
    items: Vec<WorkItem>,
    calls: AtomicU32,
}

impl FixedSource {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            items,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemSource for FixedSource {
    async fn load_items(&self, _date: WorkDate) -> anyhow::Result<Vec<WorkItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.clone())
    }
}
