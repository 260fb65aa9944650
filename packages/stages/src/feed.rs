//! Daily RSS feed as the fetch leader's item source.
//!
//! The feed is downloaded once per date and saved as `rss.json`; a restarted
//! leader reuses the saved list so its partition input never changes.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pipeline::{ItemSource, WorkDate, WorkItem};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::layout::{write_atomic, Layout};

static ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<item\b[^>]*>(.*?)</item>").unwrap());
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<link\b[^>]*>(.*?)</link>").unwrap());
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title>").unwrap());
static GUID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<guid\b[^>]*>(.*?)</guid>").unwrap());
static PUB_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<pubDate\b[^>]*>(.*?)</pubDate>").unwrap());
static CDATA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").unwrap());
static NUMERIC_ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").unwrap());

/// Stable item id: SHA-256 hex of the entry's link.
pub fn item_id(link: &str) -> String {
    hex::encode(Sha256::digest(link.as_bytes()))
}

fn decode_entities(text: &str) -> String {
    let named = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'");
    let numeric = NUMERIC_ENTITY_RE.replace_all(&named, |caps: &regex::Captures| {
        let code = &caps[1];
        let value = match code.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => code.parse().ok(),
        };
        value
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    });
    // Last, so "&amp;lt;" stays "&lt;".
    numeric.replace("&amp;", "&")
}

fn field(re: &Regex, block: &str) -> Option<String> {
    let raw = re.captures(block)?.get(1)?.as_str();
    let text = match CDATA_RE.captures(raw) {
        Some(cdata) => cdata[1].to_string(),
        None => decode_entities(raw),
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Parse `<item>` entries of an RSS 2.0 document, in feed order.
///
/// Entries with neither a link nor a URL-valued guid are dropped.
pub fn parse_feed(xml: &str) -> Vec<WorkItem> {
    ITEM_RE
        .captures_iter(xml)
        .filter_map(|caps| {
            let block = caps.get(1)?.as_str();
            let guid = field(&GUID_RE, block);
            let link = field(&LINK_RE, block).or_else(|| {
                guid.clone()
                    .filter(|g| g.starts_with("http://") || g.starts_with("https://"))
            })?;

            let mut item = WorkItem::new(item_id(&link), link);
            if let Some(title) = field(&TITLE_RE, block) {
                item = item.with_title(title);
            }
            if let Some(published) = field(&PUB_DATE_RE, block) {
                item = item.with_published(published);
            }
            Some(item)
        })
        .collect()
}

/// Downloads the day's feed from a `{date}` URL template.
pub struct RssItemSource {
    client: reqwest::Client,
    url_template: String,
    layout: Layout,
    sample_size: usize,
}

impl RssItemSource {
    pub fn new(url_template: impl Into<String>, layout: Layout, sample_size: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent(concat!("story-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url_template: url_template.into(),
            layout,
            sample_size,
        })
    }

    pub fn feed_url(&self, date: WorkDate) -> String {
        self.url_template.replace("{date}", &date.to_string())
    }

    async fn download(&self, date: WorkDate) -> Result<Vec<WorkItem>> {
        let url = self.feed_url(date);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("feed request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {} for {}", status, url);
        }

        let body = response.text().await.context("Failed to read feed body")?;
        let items = parse_feed(&body);
        info!(url = %url, items = items.len(), "downloaded feed");
        Ok(items)
    }
}

async fn read_saved(path: &Path) -> Result<Option<Vec<WorkItem>>> {
    match tokio::fs::read(path).await {
        Ok(raw) => {
            let items = serde_json::from_slice(&raw)
                .with_context(|| format!("corrupt item list {}", path.display()))?;
            Ok(Some(items))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

#[async_trait]
impl ItemSource for RssItemSource {
    async fn load_items(&self, date: WorkDate) -> Result<Vec<WorkItem>> {
        let path = self.layout.rss_path(date);
        if let Some(items) = read_saved(&path).await? {
            info!(path = %path.display(), items = items.len(), "reusing saved item list");
            return Ok(items);
        }

        let mut items = self.download(date).await?;
        if self.sample_size > 0 && items.len() > self.sample_size {
            debug!(sample_size = self.sample_size, total = items.len(), "sampling feed");
            items.truncate(self.sample_size);
        }

        write_atomic(&path, &serde_json::to_vec_pretty(&items)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(items)
    }
}
