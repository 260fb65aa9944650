//! On-disk layout of a pipeline run and the per-item artifacts.
//!
//! ```text
//! <data_root>/
//!   2024-01-01/
//!     rss.json                      source items for the date
//!     state.json                    state marker (see pipeline::state_store)
//!     content/
//!       batch-0/                    folder reference passed between stages
//!         <id>.raw.html
//!         <id>.http_meta.json
//!         <id>.extracted_meta.json
//! <archive_root>/
//!   2024-01-01/content/batch-0/     archived folder, same relative path
//! ```

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use pipeline::{PipelineError, WorkDate, WorkItem};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::PageMetadata;

pub const RSS_FILE: &str = "rss.json";
pub const CONTENT_DIR: &str = "content";
pub const RAW_HTML_SUFFIX: &str = ".raw.html";
pub const HTTP_META_SUFFIX: &str = ".http_meta.json";
pub const EXTRACTED_META_SUFFIX: &str = ".extracted_meta.json";

#[derive(Debug, Clone)]
pub struct Layout {
    data_root: PathBuf,
    archive_root: PathBuf,
}

impl Layout {
    pub fn new(data_root: impl Into<PathBuf>, archive_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            archive_root: archive_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn date_dir(&self, date: WorkDate) -> PathBuf {
        self.data_root.join(date.to_string())
    }

    pub fn rss_path(&self, date: WorkDate) -> PathBuf {
        self.date_dir(date).join(RSS_FILE)
    }

    pub fn batch_dir(&self, date: WorkDate, batch_index: usize) -> PathBuf {
        self.date_dir(date)
            .join(CONTENT_DIR)
            .join(format!("batch-{batch_index}"))
    }

    /// Archive location for a folder under the data root.
    pub fn archive_destination(&self, folder: &Path) -> pipeline::Result<PathBuf> {
        let relative = folder.strip_prefix(&self.data_root).map_err(|_| {
            PipelineError::malformed(
                folder.to_string_lossy(),
                format!("not under data root {}", self.data_root.display()),
            )
        })?;
        if relative.as_os_str().is_empty() {
            return Err(PipelineError::malformed(
                folder.to_string_lossy(),
                "refusing to archive the data root itself",
            ));
        }
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(PipelineError::malformed(
                folder.to_string_lossy(),
                "parent-directory components would leave the archive root",
            ));
        }
        Ok(self.archive_root.join(relative))
    }
}

pub fn raw_html_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}{RAW_HTML_SUFFIX}"))
}

pub fn http_meta_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}{HTTP_META_SUFFIX}"))
}

pub fn extracted_meta_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}{EXTRACTED_META_SUFFIX}"))
}

/// Item id from an artifact file name with the given suffix.
pub fn item_id<'a>(file_name: &'a str, suffix: &str) -> Option<&'a str> {
    file_name
        .strip_suffix(suffix)
        .filter(|id| !id.is_empty())
}

/// File names in `dir` ending in `suffix`, sorted.
pub async fn list_artifacts(dir: &Path, suffix: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let matches = name
            .to_str()
            .and_then(|name| item_id(name, suffix))
            .is_some();
        if matches && entry.file_type().await?.is_file() {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Write-temp-then-rename so readers never see a partial file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

// ============================================================================
// Artifacts
// ============================================================================

/// `<id>.http_meta.json`: what the fetcher saw for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpMeta {
    pub rss_entry: WorkItem,
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// `<id>.extracted_meta.json`: extractor output. `meta` is `{}` when the
/// page had no usable content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMeta {
    pub rss_entry: WorkItem,
    #[serde(default)]
    pub meta: PageMetadata,
}
