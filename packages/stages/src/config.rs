//! Worker configuration: environment variables plus per-binary CLI flags.
//!
//! Environment is loaded from `.env` when present (development). Missing or
//! invalid values are configuration errors and always surface before a
//! worker connects to the broker.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Args;
use pipeline::{
    Backoff, BatchConsumerConfig, BatchSlot, NatsSettings, PipelineError, ReadinessConfig,
    Result, RuntimeConfig, WorkDate,
};
use uuid::Uuid;

use crate::layout::Layout;
use crate::queues;

/// Settings shared by every stage binary.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub nats: NatsSettings,
    pub data_root: PathBuf,
    pub archive_root: PathBuf,
    /// Daily feed URL with a `{date}` placeholder (fetcher only).
    pub rss_url_template: Option<String>,
    /// Elasticsearch base URL (indexer only).
    pub elastic_url: Option<String>,
    pub elastic_index: String,
    pub readiness: ReadinessConfig,
    pub connect_max_attempts: u32,
    pub fetch_concurrency: usize,
}

impl PipelineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let data_root = PathBuf::from(
            var("PIPELINE_DATA_ROOT")
                .ok_or_else(|| PipelineError::configuration("PIPELINE_DATA_ROOT must be set"))?,
        );
        let archive_root = var("PIPELINE_ARCHIVE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_root.join("archive"));

        let nats = NatsSettings {
            url: var("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string()),
            stream: var("NATS_STREAM").unwrap_or_else(|| "PIPELINE".to_string()),
            prefix: var("QUEUE_PREFIX").unwrap_or_else(|| "pipeline".to_string()),
            ..NatsSettings::default()
        };

        let readiness = ReadinessConfig {
            startup_delay: Duration::from_millis(parse_or(
                &var,
                "READINESS_STARTUP_DELAY_MS",
                1_000u64,
            )?),
            poll_interval: Duration::from_millis(parse_or(
                &var,
                "READINESS_POLL_INTERVAL_MS",
                10_000u64,
            )?),
            max_wait: parse_opt::<u64>(&var, "READINESS_MAX_WAIT_SECS")?.map(Duration::from_secs),
        };
        if readiness.poll_interval.is_zero() {
            return Err(PipelineError::configuration(
                "READINESS_POLL_INTERVAL_MS must be positive",
            ));
        }

        let rss_url_template = var("RSS_URL_TEMPLATE");
        if let Some(template) = &rss_url_template {
            if !template.contains("{date}") {
                return Err(PipelineError::configuration(
                    "RSS_URL_TEMPLATE must contain a {date} placeholder",
                ));
            }
        }

        let connect_max_attempts = parse_or(&var, "CONNECT_MAX_ATTEMPTS", 5u32)?;
        let fetch_concurrency = parse_or(&var, "FETCH_CONCURRENCY", 8usize)?;
        if connect_max_attempts == 0 || fetch_concurrency == 0 {
            return Err(PipelineError::configuration(
                "CONNECT_MAX_ATTEMPTS and FETCH_CONCURRENCY must be at least 1",
            ));
        }

        Ok(Self {
            nats,
            data_root,
            archive_root,
            rss_url_template,
            elastic_url: var("ELASTIC_URL"),
            elastic_index: var("ELASTIC_INDEX")
                .unwrap_or_else(|| "mediacloud_search_text".to_string()),
            readiness,
            connect_max_attempts,
            fetch_concurrency,
        })
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.data_root, &self.archive_root)
    }

    /// Runtime settings for one worker of `stage`.
    pub fn runtime_config(&self, stage: &str) -> RuntimeConfig {
        RuntimeConfig {
            prefix: self.nats.prefix.clone(),
            worker_id: format!("{stage}-{}", Uuid::new_v4()),
            connect_backoff: Backoff::default().with_max_attempts(self.connect_max_attempts),
        }
    }

    pub fn nats_settings(&self, stage: &str) -> NatsSettings {
        NatsSettings {
            client_name: format!("pipeline-{stage}"),
            ..self.nats.clone()
        }
    }

    pub fn require_rss_url_template(&self) -> Result<&str> {
        self.rss_url_template
            .as_deref()
            .ok_or_else(|| PipelineError::configuration("RSS_URL_TEMPLATE must be set"))
    }

    pub fn require_elastic_url(&self) -> Result<&str> {
        self.elastic_url
            .as_deref()
            .ok_or_else(|| PipelineError::configuration("ELASTIC_URL must be set"))
    }
}

fn parse_or<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    Ok(parse_opt(var, name)?.unwrap_or(default))
}

fn parse_opt<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    var(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| {
                PipelineError::configuration(format!("{name} has an invalid value: {raw:?}"))
            })
        })
        .transpose()
}

// ============================================================================
// CLI flags
// ============================================================================

/// Flags for a fetch worker.
#[derive(Debug, Clone, Args)]
pub struct FetchArgs {
    /// The date being fetched, as YYYY-MM-DD
    #[arg(long)]
    pub date: WorkDate,

    /// Number of parallel fetch workers for this date
    #[arg(long)]
    pub num_batches: usize,

    /// This worker's batch index, in 0..num-batches
    #[arg(long)]
    pub batch_index: usize,

    /// Take only the first K feed entries before batching (0 = all)
    #[arg(long, default_value_t = 0)]
    pub sample_size: usize,
}

impl FetchArgs {
    pub fn slot(&self) -> Result<BatchSlot> {
        BatchSlot::new(self.date, self.num_batches, self.batch_index)
    }
}

/// Flags for a queue-consuming worker.
#[derive(Debug, Clone, Args)]
pub struct ConsumerArgs {
    /// Folder messages per batch
    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,

    /// Fail on malformed payloads and artifacts instead of skipping them
    #[arg(long)]
    pub strict: bool,

    /// Park batches whose finalize fails on `<queue>-quarantine` instead of stopping
    #[arg(long)]
    pub quarantine: bool,

    /// Seconds a partial batch waits for more messages before it is finalized
    #[arg(long, default_value_t = 60)]
    pub max_wait_secs: u64,
}

impl ConsumerArgs {
    pub fn consumer_config(&self, queue: &str, config: &PipelineConfig) -> BatchConsumerConfig {
        let consumer = BatchConsumerConfig::new(queue)
            .with_batch_size(self.batch_size)
            .with_strict(self.strict)
            .with_max_wait(Duration::from_secs(self.max_wait_secs))
            .with_reconnect(Backoff::default().with_max_attempts(config.connect_max_attempts));

        if self.quarantine {
            consumer.with_quarantine(queues::quarantine(queue))
        } else {
            consumer
        }
    }
}
