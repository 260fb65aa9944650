//! Archive worker
//!
//! Moves indexed batch folders under the archive root. End of the chain.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use pipeline::{BatchConsumer, NatsConnector, WorkerRuntime};
use stages_core::archive::ArchiveStage;
use stages_core::{exit, logging, queues, ConsumerArgs, PipelineConfig};

#[derive(Parser)]
#[command(name = "archiver", about = "Archive finished batch folders")]
struct Cli {
    #[command(flatten)]
    consumer: ConsumerArgs,
}

async fn run(cli: Cli) -> Result<()> {
    let config = PipelineConfig::from_env()?;

    let consumer = BatchConsumer::new(
        ArchiveStage::new(config.layout()),
        cli.consumer.consumer_config(queues::ARCHIVE, &config),
    );

    let runtime = WorkerRuntime::with_config(
        Arc::new(NatsConnector::new(config.nats_settings(queues::ARCHIVE))),
        config.runtime_config(queues::ARCHIVE),
    );
    runtime.run_until_shutdown(consumer).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    exit::report(queues::ARCHIVE, run(cli).await)
}
