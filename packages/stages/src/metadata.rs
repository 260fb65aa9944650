//! Metadata stage: turn fetched pages into `extracted_meta.json` artifacts.
//!
//! # Architecture
//!
//! ```text
//! metadata queue (folder path)
//!     │
//!     ├─► for each <id>.raw.html in the folder
//!     │       ├─ read <id>.http_meta.json (RSS entry)
//!     │       ├─ decode bytes (UTF-8, UTF-16 with BOM)
//!     │       ├─ MetadataExtractor::extract
//!     │       └─ write <id>.extracted_meta.json ({} meta on bad content)
//!     └─► hand off folder to the index queue
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use pipeline::{BatchStage, FinalizeContext, PipelineError};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::layout::{
    extracted_meta_path, http_meta_path, item_id, list_artifacts, write_atomic, ExtractedMeta,
    HttpMeta, RAW_HTML_SUFFIX,
};
use crate::queues;

/// Fields extracted from one page. All optional; an empty value serializes
/// as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tld: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
}

impl PageMetadata {
    pub fn is_empty(&self) -> bool {
        *self == PageMetadata::default()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    /// Nothing worth indexing: no title and no body text.
    #[error("page has no title and no text content")]
    BadContent,
}

/// Pulls structured metadata out of an HTML page.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, url: &str, html: &str) -> std::result::Result<PageMetadata, ExtractError>;
}

// ============================================================================
// Decoding and URL helpers
// ============================================================================

/// Decode page bytes: UTF-8 (optional BOM), or UTF-16 when a BOM says so.
pub fn decode_html(bytes: &[u8]) -> Option<String> {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8(rest.to_vec()).ok();
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    std::str::from_utf8(bytes).ok().map(str::to_owned)
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "ocid"];

/// Canonical form used for document identity: http(s) only, no fragment,
/// no `www.`, no tracking parameters, no trailing slash.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);

    let host = url.host_str()?.to_ascii_lowercase();
    if let Some(bare) = host.strip_prefix("www.") {
        let bare = bare.to_string();
        url.set_host(Some(&bare)).ok()?;
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| {
            !key.starts_with("utm_") && !TRACKING_PARAMS.contains(&key.as_ref())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Some(url.to_string())
}

/// Publication dates come in many shapes; keep the ones we can read.
pub fn normalize_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
        return Some(parsed.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    let day = raw.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn domain_parts(normalized: &str) -> (Option<String>, Option<String>) {
    let Some(host) = Url::parse(normalized)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
    else {
        return (None, None);
    };
    let tld = host
        .rsplit('.')
        .next()
        .filter(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphabetic()))
        .map(str::to_owned);
    (Some(host), tld)
}

// ============================================================================
// HTML extractor
// ============================================================================

/// [`MetadataExtractor`] over `scraper`'s HTML tree.
#[derive(Debug, Default, Clone)]
pub struct HtmlMetadataExtractor;

impl HtmlMetadataExtractor {
    pub fn new() -> Self {
        Self
    }

    fn first_attr(document: &Html, selectors: &[&str], attr: &str) -> Option<String> {
        selectors.iter().find_map(|selector| {
            let selector = Selector::parse(selector).ok()?;
            document
                .select(&selector)
                .filter_map(|el| el.value().attr(attr))
                .map(str::trim)
                .find(|value| !value.is_empty())
                .map(str::to_owned)
        })
    }

    fn first_text(document: &Html, selector: &str) -> Option<String> {
        let selector = Selector::parse(selector).ok()?;
        document
            .select(&selector)
            .map(|el| collapse_whitespace(&element_text(el)))
            .find(|text| !text.is_empty())
    }

    fn title(document: &Html) -> Option<String> {
        Self::first_attr(
            document,
            &["meta[property='og:title']", "meta[name='twitter:title']"],
            "content",
        )
        .or_else(|| Self::first_text(document, "title"))
        .or_else(|| Self::first_text(document, "h1"))
    }

    fn language(document: &Html) -> Option<String> {
        Self::first_attr(document, &["html[lang]"], "lang")
            .or_else(|| {
                Self::first_attr(document, &["meta[http-equiv='content-language']"], "content")
            })
            .and_then(|lang| {
                lang.split(['-', '_'])
                    .next()
                    .map(|primary| primary.trim().to_ascii_lowercase())
            })
            .filter(|lang| !lang.is_empty())
    }

    fn publication_date(document: &Html) -> Option<String> {
        let candidates = [
            ("meta[property='article:published_time']", "content"),
            ("meta[itemprop='datePublished']", "content"),
            ("meta[name='pubdate']", "content"),
            ("meta[name='date']", "content"),
            ("meta[name='dc.date']", "content"),
            ("time[datetime]", "datetime"),
        ];
        candidates.iter().find_map(|(selector, attr)| {
            Self::first_attr(document, &[*selector], attr).and_then(|raw| normalize_date(&raw))
        })
    }

    fn canonical_url(document: &Html, page_url: &str) -> Option<String> {
        let base = Url::parse(page_url).ok();
        Self::first_attr(document, &["link[rel='canonical']"], "href")
            .or_else(|| Self::first_attr(document, &["meta[property='og:url']"], "content"))
            .and_then(|href| match &base {
                Some(base) => base.join(&href).ok().map(String::from),
                None => Url::parse(&href).ok().map(String::from),
            })
    }

    fn text_content(document: &Html) -> Option<String> {
        let selector = Selector::parse("p").ok()?;
        let paragraphs: Vec<String> = document
            .select(&selector)
            .map(|el| collapse_whitespace(&element_text(el)))
            .filter(|text| !text.is_empty())
            .collect();
        (!paragraphs.is_empty()).then(|| paragraphs.join("\n\n"))
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl MetadataExtractor for HtmlMetadataExtractor {
    fn extract(&self, url: &str, html: &str) -> std::result::Result<PageMetadata, ExtractError> {
        let document = Html::parse_document(html);

        let article_title = Self::title(&document);
        let text_content = Self::text_content(&document);
        if article_title.is_none() && text_content.is_none() {
            return Err(ExtractError::BadContent);
        }

        let canonical_url = Self::canonical_url(&document, url);
        let normalized_url = canonical_url
            .as_deref()
            .and_then(normalize_url)
            .or_else(|| normalize_url(url));
        let (canonical_domain, tld) = normalized_url
            .as_deref()
            .map(domain_parts)
            .unwrap_or((None, None));

        Ok(PageMetadata {
            article_title,
            language: Self::language(&document),
            publication_date: Self::publication_date(&document),
            canonical_url,
            normalized_url,
            canonical_domain,
            tld,
            text_content,
        })
    }
}

// ============================================================================
// Stage
// ============================================================================

#[derive(Debug, Default)]
struct FolderSummary {
    extracted: usize,
    empty: usize,
}

/// Consumes folder paths from the metadata queue.
pub struct MetadataStage {
    extractor: Arc<dyn MetadataExtractor>,
}

impl MetadataStage {
    pub fn new(extractor: Arc<dyn MetadataExtractor>) -> Self {
        Self { extractor }
    }

    async fn process_folder(&self, folder: &Path, ctx: &mut FinalizeContext) -> Result<FolderSummary> {
        let mut summary = FolderSummary::default();
        let pages = list_artifacts(folder, RAW_HTML_SUFFIX)
            .await
            .with_context(|| format!("listing {}", folder.display()))?;

        for raw_path in pages {
            let Some(id) = raw_path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| item_id(name, RAW_HTML_SUFFIX))
                .map(str::to_owned)
            else {
                continue;
            };

            let meta_path = http_meta_path(folder, &id);
            let http_meta: HttpMeta = match read_json(&meta_path).await {
                Ok(meta) => meta,
                Err(e) => {
                    ctx.skip_malformed(PipelineError::malformed(
                        meta_path.to_string_lossy(),
                        format!("{e:#}"),
                    ))?;
                    continue;
                }
            };

            let bytes = tokio::fs::read(&raw_path)
                .await
                .with_context(|| format!("reading {}", raw_path.display()))?;
            let Some(html) = decode_html(&bytes) else {
                ctx.skip_malformed(PipelineError::malformed(
                    raw_path.to_string_lossy(),
                    "not UTF-8 or BOM-marked UTF-16",
                ))?;
                continue;
            };

            let meta = match self.extractor.extract(&http_meta.rss_entry.source, &html) {
                Ok(mut meta) => {
                    if meta.publication_date.is_none() {
                        meta.publication_date = http_meta
                            .rss_entry
                            .published
                            .as_deref()
                            .and_then(normalize_date);
                    }
                    summary.extracted += 1;
                    meta
                }
                Err(ExtractError::BadContent) => {
                    debug!(id = %id, "no usable content");
                    summary.empty += 1;
                    PageMetadata::default()
                }
            };

            let extracted = ExtractedMeta {
                rss_entry: http_meta.rss_entry,
                meta,
            };
            let out_path = extracted_meta_path(folder, &id);
            write_atomic(&out_path, &serde_json::to_vec(&extracted)?)
                .await
                .with_context(|| format!("writing {}", out_path.display()))?;
        }

        Ok(summary)
    }
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Payloads must name an existing directory.
pub(crate) async fn existing_folder(payload: &str) -> Result<PathBuf> {
    let path = PathBuf::from(payload.trim());
    let metadata = tokio::fs::metadata(&path)
        .await
        .with_context(|| format!("{} does not exist", path.display()))?;
    anyhow::ensure!(metadata.is_dir(), "{} is not a directory", path.display());
    Ok(path)
}

#[async_trait]
impl BatchStage for MetadataStage {
    type Item = PathBuf;

    fn name(&self) -> &str {
        queues::METADATA
    }

    async fn consume_one(&mut self, payload: &str) -> Result<PathBuf> {
        existing_folder(payload).await
    }

    async fn finalize_batch(&mut self, items: &[PathBuf], ctx: &mut FinalizeContext) -> Result<()> {
        for folder in items {
            let summary = self.process_folder(folder, ctx).await?;
            info!(
                folder = %folder.display(),
                extracted = summary.extracted,
                empty = summary.empty,
                "extracted metadata"
            );
            ctx.hand_off(queues::INDEX, folder);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE: &str = r#"<!doctype html>
<html lang="en-US">
<head>
  <title>Council approves budget | Example News</title>
  <meta property="og:title" content="Council approves budget">
  <meta property="article:published_time" content="2024-01-01T10:30:00-05:00">
  <link rel="canonical" href="https://www.news.example.com/2024/01/01/budget/?utm_source=rss#top">
</head>
<body>
  <nav><p>Home</p></nav>
  <article>
    <p>The city council   approved the budget on Monday.</p>
    <p></p>
    <p>It takes effect in March.</p>
  </article>
</body>
</html>"#;

    #[test]
    fn test_extracts_article_fields() {
        let meta = HtmlMetadataExtractor::new()
            .extract("https://news.example.com/feed-link", ARTICLE)
            .unwrap();

        assert_eq!(meta.article_title.as_deref(), Some("Council approves budget"));
        assert_eq!(meta.language.as_deref(), Some("en"));
        assert_eq!(meta.publication_date.as_deref(), Some("2024-01-01T15:30:00Z"));
        assert_eq!(
            meta.normalized_url.as_deref(),
            Some("https://news.example.com/2024/01/01/budget")
        );
        assert_eq!(meta.canonical_domain.as_deref(), Some("news.example.com"));
        assert_eq!(meta.tld.as_deref(), Some("com"));
        let text = meta.text_content.unwrap();
        assert!(text.contains("The city council approved the budget on Monday."));
        assert!(text.ends_with("It takes effect in March."));
    }

    #[test]
    fn test_empty_page_is_bad_content() {
        let result = HtmlMetadataExtractor::new()
            .extract("https://example.com/", "<html><body><div></div></body></html>");
        assert_eq!(result, Err(ExtractError::BadContent));
    }

    #[test]
    fn test_falls_back_to_page_url() {
        let meta = HtmlMetadataExtractor::new()
            .extract("https://Example.org/a/?fbclid=1&id=4", "<title>Hi</title>")
            .unwrap();
        assert_eq!(meta.normalized_url.as_deref(), Some("https://example.org/a?id=4"));
        assert_eq!(meta.text_content, None);
    }

    #[test]
    fn test_decode_html() {
        assert_eq!(decode_html("héllo".as_bytes()).as_deref(), Some("héllo"));
        assert_eq!(decode_html(b"\xEF\xBB\xBFhi").as_deref(), Some("hi"));

        let utf16le: Vec<u8> = [0xFF, 0xFE]
            .into_iter()
            .chain("hé".encode_utf16().flat_map(u16::to_le_bytes))
            .collect();
        assert_eq!(decode_html(&utf16le).as_deref(), Some("hé"));

        let utf16be: Vec<u8> = [0xFE, 0xFF]
            .into_iter()
            .chain("hé".encode_utf16().flat_map(u16::to_be_bytes))
            .collect();
        assert_eq!(decode_html(&utf16be).as_deref(), Some("hé"));

        assert_eq!(decode_html(b"caf\xE9"), None);
    }

    #[test]
    fn test_normalize_date_shapes() {
        assert_eq!(
            normalize_date("Mon, 01 Jan 2024 10:00:00 GMT").as_deref(),
            Some("2024-01-01T10:00:00Z")
        );
        assert_eq!(
            normalize_date("2024-01-01").as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(normalize_date("yesterday"), None);
    }

    #[test]
    fn test_normalize_url_rejects_non_http() {
        assert_eq!(normalize_url("mailto:desk@example.com"), None);
        assert_eq!(normalize_url("not a url"), None);
    }
}
