//! Fetch stage: one of N parallel workers for a date.
//!
//! # Architecture
//!
//! ```text
//! ReadinessLatch::acquire ──► this worker's share of the day's items
//!     │
//!     ├─► PageFetcher (bounded concurrency, failures skipped)
//!     │       └─ <id>.raw.html + <id>.http_meta.json in content/batch-<i>/
//!     │
//!     └─► publish batch folder to the metadata queue, then stop
//! ```
//!
//! Items whose `http_meta.json` already exists are not fetched again, so a
//! restarted worker only finishes what is missing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt};
use pipeline::{
    BatchSlot, ItemSource, PipelineError, ReadinessLatch, Stage, StageContext, WorkItem,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::layout::{http_meta_path, raw_html_path, write_atomic, HttpMeta, Layout};
use crate::queues;

/// A downloaded page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// [`PageFetcher`] over reqwest. Non-success statuses are errors.
pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("story-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {} for {}", status, url);
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response
            .bytes()
            .await
            .with_context(|| format!("reading body of {url}"))?;

        Ok(FetchedPage {
            url: final_url,
            status: status.as_u16(),
            content_type,
            body: body.to_vec(),
        })
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub fetched: usize,
    pub already_present: usize,
    pub failed: usize,
}

pub struct FetchStage {
    slot: BatchSlot,
    layout: Layout,
    latch: ReadinessLatch,
    source: Arc<dyn ItemSource>,
    fetcher: Arc<dyn PageFetcher>,
    concurrency: usize,
}

impl FetchStage {
    pub fn new(
        slot: BatchSlot,
        layout: Layout,
        latch: ReadinessLatch,
        source: Arc<dyn ItemSource>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        Self {
            slot,
            layout,
            latch,
            source,
            fetcher,
            concurrency: 8,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn batch_folder(&self) -> PathBuf {
        self.layout.batch_dir(self.slot.date, self.slot.batch_index)
    }

    async fn fetch_share(
        &self,
        folder: &Path,
        share: Vec<WorkItem>,
        shutdown: &CancellationToken,
    ) -> Result<FetchSummary> {
        let mut summary = FetchSummary::default();

        let mut pending = Vec::with_capacity(share.len());
        for item in share {
            let done = tokio::fs::try_exists(http_meta_path(folder, &item.id))
                .await
                .with_context(|| format!("checking {}", folder.display()))?;
            if done {
                summary.already_present += 1;
            } else {
                pending.push(item);
            }
        }

        let fetcher = &self.fetcher;
        let mut results = std::pin::pin!(stream::iter(pending)
            .map(|item| async move {
                let outcome = fetch_one(fetcher.as_ref(), folder, &item).await;
                (item, outcome)
            })
            .buffer_unordered(self.concurrency)
            .take_until(shutdown.cancelled()));

        while let Some((item, outcome)) = results.next().await {
            match outcome {
                Ok(()) => {
                    debug!(id = %item.id, url = %item.source, "fetched");
                    summary.fetched += 1;
                }
                Err(e) => {
                    warn!(id = %item.id, url = %item.source, error = %format_args!("{e:#}"), "skipping page");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}

/// Write the page, then its http_meta; the meta file marks the item done.
async fn fetch_one(fetcher: &dyn PageFetcher, folder: &Path, item: &WorkItem) -> Result<()> {
    let page = fetcher.fetch(&item.source).await?;

    let raw_path = raw_html_path(folder, &item.id);
    write_atomic(&raw_path, &page.body)
        .await
        .with_context(|| format!("writing {}", raw_path.display()))?;

    let meta = HttpMeta {
        rss_entry: item.clone(),
        url: page.url,
        status: page.status,
        content_type: page.content_type,
        fetched_at: Utc::now(),
    };
    let meta_path = http_meta_path(folder, &item.id);
    write_atomic(&meta_path, &serde_json::to_vec_pretty(&meta)?)
        .await
        .with_context(|| format!("writing {}", meta_path.display()))?;
    Ok(())
}

#[async_trait]
impl Stage for FetchStage {
    fn name(&self) -> &str {
        queues::FETCH
    }

    fn validate(&self) -> pipeline::Result<()> {
        if self.concurrency == 0 {
            return Err(PipelineError::configuration(
                "fetch concurrency must be at least 1",
            ));
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &StageContext) -> pipeline::Result<()> {
        let share = self
            .latch
            .acquire(self.slot, self.source.as_ref(), &ctx.shutdown)
            .await?;

        let folder = self.batch_folder();
        tokio::fs::create_dir_all(&folder).await?;

        let summary = self
            .fetch_share(&folder, share, &ctx.shutdown)
            .await
            .map_err(|source| PipelineError::Stage {
                stage: queues::FETCH.to_string(),
                source,
            })?;

        if ctx.is_shutting_down() {
            warn!(
                folder = %folder.display(),
                fetched = summary.fetched,
                "shutdown during fetch, folder not handed off"
            );
            return Ok(());
        }

        let payload = folder.to_string_lossy();
        ctx.channel.publish(queues::METADATA, &payload).await?;
        info!(
            date = %self.slot.date,
            batch_index = self.slot.batch_index,
            folder = %payload,
            fetched = summary.fetched,
            already_present = summary.already_present,
            failed = summary.failed,
            "batch fetched and handed off"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pipeline::testing::{MemoryChannel, MemoryStateStore};
    use pipeline::{ReadinessConfig, WorkDate};

    struct StaticFetcher {
        pages: HashMap<String, &'static str>,
        calls: AtomicUsize,
    }

    impl StaticFetcher {
        fn new(pages: &[(&str, &'static str)]) -> Self {
            Self {
                pages: pages.iter().map(|(u, b)| (u.to_string(), *b)).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = self
                .pages
                .get(url)
                .ok_or_else(|| anyhow::anyhow!("HTTP 404 Not Found for {url}"))?;
            Ok(FetchedPage {
                url: url.to_string(),
                status: 200,
                content_type: Some("text/html".into()),
                body: body.as_bytes().to_vec(),
            })
        }
    }

    struct Items(Vec<WorkItem>);

    #[async_trait]
    impl ItemSource for Items {
        async fn load_items(&self, _date: WorkDate) -> Result<Vec<WorkItem>> {
            Ok(self.0.clone())
        }
    }

    fn stage(dir: &Path, fetcher: Arc<StaticFetcher>) -> FetchStage {
        let date: WorkDate = "2024-01-01".parse().unwrap();
        let items = vec![
            WorkItem::new("a", "https://example.com/a"),
            WorkItem::new("b", "https://example.com/b"),
            WorkItem::new("gone", "https://example.com/gone"),
        ];
        let latch = ReadinessLatch::with_config(
            Arc::new(MemoryStateStore::new()),
            ReadinessConfig {
                startup_delay: Duration::ZERO,
                poll_interval: Duration::from_millis(10),
                max_wait: None,
            },
        );
        FetchStage::new(
            BatchSlot::new(date, 1, 0).unwrap(),
            Layout::new(dir, dir.join("archive")),
            latch,
            Arc::new(Items(items)),
            fetcher,
        )
        .with_concurrency(2)
    }

    fn context(channel: &MemoryChannel) -> StageContext {
        StageContext::new(Arc::new(channel.clone()), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_fetches_share_and_hands_off_folder() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(StaticFetcher::new(&[
            ("https://example.com/a", "<p>a</p>"),
            ("https://example.com/b", "<p>b</p>"),
        ]));
        let mut stage = stage(dir.path(), fetcher.clone());
        let channel = MemoryChannel::new();

        stage.run(&context(&channel)).await.unwrap();

        let folder = stage.batch_folder();
        assert_eq!(
            std::fs::read_to_string(raw_html_path(&folder, "a")).unwrap(),
            "<p>a</p>"
        );
        let meta: HttpMeta =
            serde_json::from_slice(&std::fs::read(http_meta_path(&folder, "b")).unwrap()).unwrap();
        assert_eq!(meta.rss_entry.id, "b");
        assert_eq!(meta.status, 200);
        assert!(!http_meta_path(&folder, "gone").exists());

        assert_eq!(
            channel.published_to(queues::METADATA),
            vec![folder.to_string_lossy().into_owned()]
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_restart_skips_fetched_items() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(StaticFetcher::new(&[
            ("https://example.com/a", "<p>a</p>"),
            ("https://example.com/b", "<p>b</p>"),
        ]));
        let channel = MemoryChannel::new();

        stage(dir.path(), fetcher.clone())
            .run(&context(&channel))
            .await
            .unwrap();
        stage(dir.path(), fetcher.clone())
            .run(&context(&channel))
            .await
            .unwrap();

        // Second run only retries the page that failed.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
        assert_eq!(channel.published_to(queues::METADATA).len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_does_not_hand_off() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(StaticFetcher::new(&[]));
        let mut stage = stage(dir.path(), fetcher);
        let channel = MemoryChannel::new();
        let ctx = context(&channel);
        ctx.shutdown.cancel();

        stage.run(&ctx).await.unwrap();
        assert!(channel.published_to(queues::METADATA).is_empty());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let stage = stage(dir.path(), Arc::new(StaticFetcher::new(&[]))).with_concurrency(0);
        assert!(matches!(
            stage.validate(),
            Err(PipelineError::Configuration(_))
        ));
    }
}
