use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

static TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());
static LOADING_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#".slds-spinner, [class*="loading"]"#).unwrap());

/// A parsed snapshot of one CRM page together with the URL it was taken from.
pub struct Page {
    url: String,
    html: Html,
}

impl Page {
    pub fn parse(url: &str, html: &str) -> Self {
        Self {
            url: url.to_string(),
            html: Html::parse_document(html),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// URL path component, or the raw URL when it does not parse.
    pub fn path(&self) -> String {
        match reqwest::Url::parse(&self.url) {
            Ok(url) => url.path().to_string(),
            Err(_) => self.url.clone(),
        }
    }

    pub fn title(&self) -> String {
        self.html
            .select(&TITLE_SEL)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
            .unwrap_or_default()
    }

    pub fn html(&self) -> &Html {
        &self.html
    }

    pub fn first(&self, selector: &Selector) -> Option<ElementRef<'_>> {
        self.html.select(selector).next()
    }

    pub fn has(&self, selector: &Selector) -> bool {
        self.first(selector).is_some()
    }

    /// True while a spinner or any `*loading*` element is present.
    pub fn is_loading(&self) -> bool {
        self.has(&LOADING_SEL)
    }
}

// ── Sources ──

/// Where page snapshots come from. Each call to `snapshot` returns the page as it
/// is now, so a source that changes over time is re-read on every call.
pub trait PageSource: Send + Sync {
    fn describe(&self) -> String;
    fn snapshot(&self) -> Result<Page>;
}

/// An HTML file on disk, re-read on every snapshot.
pub struct FileSource {
    path: PathBuf,
    url: String,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>, url: &str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            url: url.to_string(),
        }
    }
}

impl PageSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn snapshot(&self) -> Result<Page> {
        let html = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        Ok(Page::parse(&self.url, &html))
    }
}

/// HTML held in memory, typically fetched once.
pub struct StaticSource {
    url: String,
    html: String,
}

impl StaticSource {
    pub fn new(url: &str, html: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            html: html.into(),
        }
    }
}

impl PageSource for StaticSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn snapshot(&self) -> Result<Page> {
        Ok(Page::parse(&self.url, &self.html))
    }
}

pub async fn fetch(url: &str) -> Result<StaticSource> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch {url}"))?
        .error_for_status()?;
    let html = resp.text().await?;
    debug!("Fetched {} ({} bytes)", url, html.len());
    Ok(StaticSource::new(url, html))
}
