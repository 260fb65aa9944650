//! Index worker
//!
//! Bulk-writes extracted metadata to Elasticsearch, then hands each folder
//! to the archiver.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use pipeline::{BatchConsumer, NatsConnector, WorkerRuntime};
use stages_core::index::{ElasticsearchIndex, IndexStage};
use stages_core::{exit, logging, queues, ConsumerArgs, PipelineConfig};

#[derive(Parser)]
#[command(name = "indexer", about = "Index extracted story metadata")]
struct Cli {
    #[command(flatten)]
    consumer: ConsumerArgs,
}

async fn run(cli: Cli) -> Result<()> {
    let config = PipelineConfig::from_env()?;
    let index = ElasticsearchIndex::new(config.require_elastic_url()?, &config.elastic_index)?;

    let consumer = BatchConsumer::new(
        IndexStage::new(Arc::new(index)),
        cli.consumer.consumer_config(queues::INDEX, &config),
    );

    let runtime = WorkerRuntime::with_config(
        Arc::new(NatsConnector::new(config.nats_settings(queues::INDEX))),
        config.runtime_config(queues::INDEX),
    );
    runtime.run_until_shutdown(consumer).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    exit::report(queues::INDEX, run(cli).await)
}
