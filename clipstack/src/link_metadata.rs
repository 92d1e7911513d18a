//! Link metadata fetching - extracts OG tags from link clips
//!
//! Fetches run on the tokio runtime; results come back through a channel and
//! are applied by the history on its own thread.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::models::LinkMetadata;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HTML_SIZE: usize = 512 * 1024; // 512KB max HTML

static TITLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>([^<]+)</title>").unwrap());

/// Fetch metadata for `url`. Any failure yields `None`.
pub async fn fetch_metadata(url: &str) -> Option<LinkMetadata> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko)")
        .build()
        .ok()?;

    let response = client.get(url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    if response
        .content_length()
        .is_some_and(|len| len as usize > MAX_HTML_SIZE)
    {
        return None;
    }

    let html = response.text().await.ok()?;
    if html.len() > MAX_HTML_SIZE {
        return None;
    }
    parse_metadata(url, &html)
}

/// Extract metadata from an HTML page fetched from `url`
pub fn parse_metadata(url: &str, html: &str) -> Option<LinkMetadata> {
    let title = extract_og_tag(html, "og:title").or_else(|| extract_title_tag(html));
    let description = extract_og_tag(html, "og:description");
    let image = extract_og_tag(html, "og:image").and_then(|img| resolve_url(url, &img));

    if title.is_none() && description.is_none() && image.is_none() {
        return None;
    }
    Some(LinkMetadata {
        url: url.to_string(),
        title,
        description,
        image,
    })
}

fn extract_og_tag(html: &str, property: &str) -> Option<String> {
    // <meta property="og:..." content="...">
    let pattern = format!(
        r#"(?i)<meta[^>]*property=["']{}["'][^>]*content=["']([^"']*)["']"#,
        regex::escape(property)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(html)
        .map(|c| c[1].trim().to_string())
        .or_else(|| {
            // Also try content before property
            let pattern = format!(
                r#"(?i)<meta[^>]*content=["']([^"']*)["'][^>]*property=["']{}["']"#,
                regex::escape(property)
            );
            let re = Regex::new(&pattern).ok()?;
            re.captures(html).map(|c| c[1].trim().to_string())
        })
        .filter(|value| !value.is_empty())
}

fn extract_title_tag(html: &str) -> Option<String> {
    TITLE_REGEX
        .captures(html)
        .map(|c| c[1].trim().to_string())
        .filter(|title| !title.is_empty())
}

fn resolve_url(base: &str, relative: &str) -> Option<String> {
    if relative.starts_with("http://") || relative.starts_with("https://") {
        return Some(relative.to_string());
    }
    if relative.starts_with("//") {
        return Some(format!("https:{}", relative));
    }
    url::Url::parse(base)
        .ok()?
        .join(relative)
        .ok()
        .map(|u| u.to_string())
}

/// Fetched metadata for one Text data row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrichment {
    pub clip_id: i64,
    pub data_id: i64,
    pub metadata: LinkMetadata,
}

pub struct LinkEnricher {
    tx: UnboundedSender<Enrichment>,
    rx: UnboundedReceiver<Enrichment>,
}

impl Default for LinkEnricher {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkEnricher {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self { tx, rx }
    }

    /// Start fetching in the background. Failures are dropped silently.
    pub fn schedule(&self, clip_id: i64, data_id: i64, url: String) {
        let tx = self.tx.clone();
        crate::runtime_handle().spawn(async move {
            match fetch_metadata(&url).await {
                Some(metadata) => {
                    let _ = tx.send(Enrichment { clip_id, data_id, metadata });
                }
                None => debug!(url = %url, "no link metadata"),
            }
        });
    }

    /// Queue a result directly, bypassing the fetch
    pub fn submit(&self, enrichment: Enrichment) {
        let _ = self.tx.send(enrichment);
    }

    /// Results ready to apply
    pub fn drain(&mut self) -> Vec<Enrichment> {
        let mut ready = Vec::new();
        while let Ok(enrichment) = self.rx.try_recv() {
            ready.push(enrichment);
        }
        ready
    }
}
