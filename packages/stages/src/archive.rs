//! Archive stage: move finished batch folders out of the working tree.
//!
//! Terminal stage of the chain; it hands nothing off. A redelivered folder
//! whose source is gone but whose destination exists counts as archived.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use pipeline::{BatchStage, FinalizeContext, PipelineError};
use tracing::{debug, info};

use crate::layout::Layout;
use crate::queues;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMove {
    pub source: PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    /// Destination already existed; contents merged into it.
    Merged,
    AlreadyArchived,
    Missing,
}

/// Move `source` to `destination`, merging when the destination exists.
pub async fn move_folder(source: &Path, destination: &Path) -> io::Result<MoveOutcome> {
    let source_exists = tokio::fs::try_exists(source).await?;
    let destination_exists = tokio::fs::try_exists(destination).await?;

    match (source_exists, destination_exists) {
        (false, true) => Ok(MoveOutcome::AlreadyArchived),
        (false, false) => Ok(MoveOutcome::Missing),
        (true, false) => {
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if tokio::fs::rename(source, destination).await.is_err() {
                // Different filesystem: copy then delete.
                merge_into(source, destination).await?;
                tokio::fs::remove_dir_all(source).await?;
            }
            Ok(MoveOutcome::Moved)
        }
        (true, true) => {
            merge_into(source, destination).await?;
            tokio::fs::remove_dir_all(source).await?;
            Ok(MoveOutcome::Merged)
        }
    }
}

fn merge_into<'a>(source: &'a Path, destination: &'a Path) -> BoxFuture<'a, io::Result<()>> {
    async move {
        tokio::fs::create_dir_all(destination).await?;
        let mut entries = tokio::fs::read_dir(source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let from = entry.path();
            let to = destination.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                merge_into(&from, &to).await?;
            } else if tokio::fs::rename(&from, &to).await.is_err() {
                tokio::fs::copy(&from, &to).await?;
            }
        }
        Ok(())
    }
    .boxed()
}

pub struct ArchiveStage {
    layout: Layout,
}

impl ArchiveStage {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl BatchStage for ArchiveStage {
    type Item = ArchiveMove;

    fn name(&self) -> &str {
        queues::ARCHIVE
    }

    async fn consume_one(&mut self, payload: &str) -> Result<ArchiveMove> {
        let source = PathBuf::from(payload.trim());
        let destination = self.layout.archive_destination(&source)?;
        Ok(ArchiveMove {
            source,
            destination,
        })
    }

    async fn finalize_batch(
        &mut self,
        items: &[ArchiveMove],
        ctx: &mut FinalizeContext,
    ) -> Result<()> {
        for item in items {
            let outcome = move_folder(&item.source, &item.destination)
                .await
                .with_context(|| {
                    format!(
                        "archiving {} to {}",
                        item.source.display(),
                        item.destination.display()
                    )
                })?;

            match outcome {
                MoveOutcome::Missing => {
                    ctx.skip_malformed(PipelineError::malformed(
                        item.source.to_string_lossy(),
                        "folder and its archive destination are both missing",
                    ))?;
                }
                MoveOutcome::AlreadyArchived => {
                    debug!(folder = %item.source.display(), "already archived");
                }
                MoveOutcome::Moved | MoveOutcome::Merged => {
                    info!(
                        folder = %item.source.display(),
                        destination = %item.destination.display(),
                        merged = outcome == MoveOutcome::Merged,
                        "archived"
                    );
                }
            }
        }
        Ok(())
    }
}
