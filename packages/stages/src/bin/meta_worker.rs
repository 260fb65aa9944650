//! Metadata worker
//!
//! Consumes batch folders from the metadata queue, writes
//! `extracted_meta.json` next to each page and hands the folder to the indexer.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use pipeline::{BatchConsumer, NatsConnector, WorkerRuntime};
use stages_core::metadata::{HtmlMetadataExtractor, MetadataStage};
use stages_core::{exit, logging, queues, ConsumerArgs, PipelineConfig};

#[derive(Parser)]
#[command(name = "meta_worker", about = "Extract page metadata for fetched batches")]
struct Cli {
    #[command(flatten)]
    consumer: ConsumerArgs,
}

async fn run(cli: Cli) -> Result<()> {
    let config = PipelineConfig::from_env()?;

    let stage = MetadataStage::new(Arc::new(HtmlMetadataExtractor::new()));
    let consumer = BatchConsumer::new(
        stage,
        cli.consumer.consumer_config(queues::METADATA, &config),
    );

    let runtime = WorkerRuntime::with_config(
        Arc::new(NatsConnector::new(config.nats_settings(queues::METADATA))),
        config.runtime_config(queues::METADATA),
    );
    runtime.run_until_shutdown(consumer).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    exit::report(queues::METADATA, run(cli).await)
}
