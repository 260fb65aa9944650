//! Fetch worker
//!
//! One of `--num-batches` workers for a date. Batch index 0 downloads the
//! feed and publishes the partition; the others wait for it.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use pipeline::{FsStateStore, NatsConnector, ReadinessLatch, WorkerRuntime};
use stages_core::feed::RssItemSource;
use stages_core::fetch::{FetchStage, HttpPageFetcher};
use stages_core::{exit, logging, queues, FetchArgs, PipelineConfig};

#[derive(Parser)]
#[command(name = "fetcher", about = "Fetch one batch of the day's RSS stories")]
struct Cli {
    #[command(flatten)]
    fetch: FetchArgs,
}

async fn run(cli: Cli) -> Result<()> {
    let config = PipelineConfig::from_env()?;
    let slot = cli.fetch.slot()?;
    let layout = config.layout();

    let source = RssItemSource::new(
        config.require_rss_url_template()?,
        layout.clone(),
        cli.fetch.sample_size,
    )?;
    let latch = ReadinessLatch::with_config(
        Arc::new(FsStateStore::new(&config.data_root)),
        config.readiness,
    );
    let stage = FetchStage::new(
        slot,
        layout,
        latch,
        Arc::new(source),
        Arc::new(HttpPageFetcher::new(Duration::from_secs(30))?),
    )
    .with_concurrency(config.fetch_concurrency);

    let runtime = WorkerRuntime::with_config(
        Arc::new(NatsConnector::new(config.nats_settings(queues::FETCH))),
        config.runtime_config(queues::FETCH),
    );
    runtime.run_until_shutdown(stage).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    exit::report(queues::FETCH, run(cli).await)
}
