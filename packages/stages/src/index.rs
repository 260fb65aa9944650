//! Index stage: bulk-write extracted metadata to the search index.
//!
//! Each document is keyed by the SHA-256 hex of its normalized URL, so a
//! redelivered batch overwrites the same documents instead of duplicating
//! them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pipeline::{BatchStage, FinalizeContext, PipelineError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::layout::{list_artifacts, ExtractedMeta, EXTRACTED_META_SUFFIX};
use crate::metadata::{existing_folder, read_json};
use crate::queues;

pub const DOCUMENT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub domain: Option<String>,
    pub first_captured: Option<String>,
    pub host: Option<String>,
    pub language: Option<String>,
    pub publication_date: Option<String>,
    pub snippet: Option<String>,
    pub title: Option<String>,
    pub tld: Option<String>,
    pub url: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub document: IndexDocument,
}

pub fn document_id(normalized_url: &str) -> String {
    hex::encode(Sha256::digest(normalized_url.as_bytes()))
}

/// `None` when extraction produced nothing indexable.
pub fn build_entry(extracted: &ExtractedMeta) -> Option<IndexEntry> {
    let meta = &extracted.meta;
    let url = meta.normalized_url.clone()?;
    let host = url::Url::parse(&url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_owned));

    Some(IndexEntry {
        id: document_id(&url),
        document: IndexDocument {
            domain: meta.canonical_domain.clone(),
            first_captured: meta.publication_date.clone(),
            host,
            language: meta.language.clone(),
            publication_date: meta.publication_date.clone(),
            snippet: meta.text_content.clone(),
            title: meta
                .article_title
                .clone()
                .or_else(|| extracted.rss_entry.title.clone()),
            tld: meta.tld.clone(),
            url,
            version: DOCUMENT_VERSION.to_string(),
        },
    })
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index if missing.
    async fn ensure_index(&self) -> Result<()>;

    /// Write all entries; any rejected entry fails the call.
    async fn bulk_index(&self, entries: &[IndexEntry]) -> Result<usize>;
}

// ============================================================================
// Elasticsearch
// ============================================================================

pub struct ElasticsearchIndex {
    client: reqwest::Client,
    base_url: String,
    index: String,
}

impl ElasticsearchIndex {
    pub fn new(base_url: &str, index: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.into(),
        })
    }

    fn index_body() -> serde_json::Value {
        json!({
            "settings": {"number_of_shards": 1, "number_of_replicas": 0},
            "mappings": {
                "properties": {
                    "domain": {"type": "keyword"},
                    "first_captured": {"type": "date"},
                    "host": {"type": "keyword"},
                    "language": {"type": "keyword"},
                    "publication_date": {"type": "date"},
                    "snippet": {"type": "text", "fielddata": true},
                    "title": {"type": "text", "fielddata": true},
                    "tld": {"type": "keyword"},
                    "url": {"type": "keyword"},
                    "version": {"type": "keyword"}
                }
            }
        })
    }
}

/// NDJSON body for `_bulk`: an action line then a source line per entry.
pub fn bulk_body(index: &str, entries: &[IndexEntry]) -> Result<String> {
    let mut body = String::new();
    for entry in entries {
        let action = json!({"index": {"_index": index, "_id": entry.id}});
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&entry.document)?);
        body.push('\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(default, rename = "_id")]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Number of accepted actions, or an error naming the first rejection.
pub fn parse_bulk_response(raw: &[u8]) -> Result<usize> {
    let response: BulkResponse =
        serde_json::from_slice(raw).context("unreadable _bulk response")?;
    let results: Vec<&BulkItem> = response.items.iter().flat_map(|item| item.values()).collect();

    let failed: Vec<&&BulkItem> = results
        .iter()
        .filter(|item| item.error.is_some() || item.status >= 300)
        .collect();
    if response.errors || !failed.is_empty() {
        let first = failed
            .first()
            .map(|item| {
                format!(
                    "{} (status {}): {}",
                    item.id.as_deref().unwrap_or("?"),
                    item.status,
                    item.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
                )
            })
            .unwrap_or_else(|| "no item detail".to_string());
        anyhow::bail!(
            "{} of {} bulk actions failed; first: {}",
            failed.len(),
            results.len(),
            first
        );
    }
    Ok(results.len())
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn ensure_index(&self) -> Result<()> {
        let url = format!("{}/{}", self.base_url, self.index);
        let response = self
            .client
            .put(&url)
            .json(&Self::index_body())
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if status.is_success() {
            info!(index = %self.index, "created index");
        } else if status == reqwest::StatusCode::BAD_REQUEST {
            debug!(index = %self.index, "index already exists");
        } else {
            anyhow::bail!("HTTP {} for {}", status, url);
        }
        Ok(())
    }

    async fn bulk_index(&self, entries: &[IndexEntry]) -> Result<usize> {
        let url = format!("{}/_bulk", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(&self.index, entries)?)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {} for {}", status, url);
        }
        let raw = response.bytes().await.context("Failed to read _bulk response")?;
        parse_bulk_response(&raw)
    }
}

// ============================================================================
// Stage
// ============================================================================

pub struct IndexStage {
    index: Arc<dyn SearchIndex>,
}

impl IndexStage {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl BatchStage for IndexStage {
    type Item = PathBuf;

    fn name(&self) -> &str {
        queues::INDEX
    }

    async fn setup(&mut self) -> Result<()> {
        self.index.ensure_index().await
    }

    async fn consume_one(&mut self, payload: &str) -> Result<PathBuf> {
        existing_folder(payload).await
    }

    async fn finalize_batch(&mut self, items: &[PathBuf], ctx: &mut FinalizeContext) -> Result<()> {
        let mut entries = Vec::new();
        let mut empty = 0usize;

        for folder in items {
            let files = list_artifacts(folder, EXTRACTED_META_SUFFIX)
                .await
                .with_context(|| format!("listing {}", folder.display()))?;
            for path in files {
                let extracted: ExtractedMeta = match read_json(&path).await {
                    Ok(extracted) => extracted,
                    Err(e) => {
                        ctx.skip_malformed(PipelineError::malformed(
                            path.to_string_lossy(),
                            format!("{e:#}"),
                        ))?;
                        continue;
                    }
                };
                match build_entry(&extracted) {
                    Some(entry) => entries.push(entry),
                    None => empty += 1,
                }
            }
        }

        let indexed = if entries.is_empty() {
            0
        } else {
            self.index.bulk_index(&entries).await?
        };
        info!(folders = items.len(), indexed, empty, "indexed batch");

        for folder in items {
            ctx.hand_off(queues::ARCHIVE, folder);
        }
        Ok(())
    }
}
