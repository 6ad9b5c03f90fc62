//! Source fetcher contracts, the source registry, and the JSON feed / fixture fetchers.

pub mod http;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evwatch_core::{Item, ItemSource};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use http::{HttpClient, HttpClientConfig, RetryPolicy};

pub const CRATE_NAME: &str = "evwatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("reading fixture: {0}")]
    Io(#[from] std::io::Error),
    #[error("fetch cancelled")]
    Cancelled,
}

/// One upstream source of event listings.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source(&self) -> ItemSource;

    fn is_enabled(&self) -> bool;

    /// Fetches the current listing. `existing` holds what the store already knows
    /// for this source; outside detailed mode fetchers may skip refreshing those.
    async fn fetch(
        &self,
        existing: &[Item],
        detailed: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Item>, AdapterError>;
}

/// Source to fetcher mapping, built once at startup.
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    fetchers: BTreeMap<ItemSource, Arc<dyn SourceFetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fetcher: Arc<dyn SourceFetcher>) -> &mut Self {
        self.fetchers.insert(fetcher.source(), fetcher);
        self
    }

    pub fn with(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.register(fetcher);
        self
    }

    pub fn get(&self, source: ItemSource) -> Option<&Arc<dyn SourceFetcher>> {
        self.fetchers.get(&source)
    }

    pub fn enabled(&self) -> Vec<(ItemSource, Arc<dyn SourceFetcher>)> {
        self.fetchers
            .iter()
            .filter(|(_, fetcher)| fetcher.is_enabled())
            .map(|(source, fetcher)| (*source, Arc::clone(fetcher)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetcherKind {
    JsonFeed,
    Fixture,
}

/// Entry of `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    pub source: ItemSource,
    pub enabled: bool,
    pub kind: FetcherKind,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub detail_url: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

pub fn build_fetcher(
    settings: &SourceSettings,
    http: &Arc<HttpClient>,
) -> Result<Arc<dyn SourceFetcher>, AdapterError> {
    match settings.kind {
        FetcherKind::JsonFeed => {
            let listing_url = settings.listing_url.clone().ok_or_else(|| {
                AdapterError::Message(format!("{}: json_feed requires listing_url", settings.source))
            })?;
            let detail_url = settings.detail_url.clone().ok_or_else(|| {
                AdapterError::Message(format!("{}: json_feed requires detail_url", settings.source))
            })?;
            Ok(Arc::new(JsonFeedFetcher {
                source: settings.source,
                enabled: settings.enabled,
                listing_url,
                detail_url,
                http: Arc::clone(http),
            }))
        }
        FetcherKind::Fixture => {
            let path = settings.path.clone().ok_or_else(|| {
                AdapterError::Message(format!("{}: fixture requires path", settings.source))
            })?;
            Ok(Arc::new(FixtureFetcher::new(settings.source, path).enabled(settings.enabled)))
        }
    }
}

/// Event record as published by the JSON feeds and fixture files.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedRecord {
    pub id: String,
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub organizer: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub enrollment_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl FeedRecord {
    pub fn into_item(self, source: ItemSource, retrieved_at: DateTime<Utc>, raw: Option<String>) -> Item {
        Item {
            source,
            source_id: self.id,
            retrieved_at,
            event_start: self.start,
            event_end: self.end.unwrap_or(self.start),
            enrollment_deadline: self.enrollment_deadline.or(Some(self.start)),
            title: self.title,
            description: self.description,
            organizer: self.organizer,
            location: self.location,
            url: self.url,
            price: self.price,
            tags: if self.tags.is_empty() { None } else { Some(self.tags) },
            raw_data: raw,
        }
    }
}

fn record_from_value(
    value: JsonValue,
    source: ItemSource,
    retrieved_at: DateTime<Utc>,
) -> Result<Item, AdapterError> {
    let raw = value.to_string();
    let record: FeedRecord = serde_json::from_value(value)?;
    Ok(record.into_item(source, retrieved_at, Some(raw)))
}

/// Reads a JSON array of [`FeedRecord`]s from disk.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    source: ItemSource,
    enabled: bool,
    path: PathBuf,
}

impl FixtureFetcher {
    pub fn new(source: ItemSource, path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            enabled: true,
            path: path.into(),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[async_trait]
impl SourceFetcher for FixtureFetcher {
    fn source(&self) -> ItemSource {
        self.source
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn fetch(
        &self,
        _existing: &[Item],
        _detailed: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Item>, AdapterError> {
        if cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }
        let text = tokio::fs::read_to_string(&self.path).await?;
        let values: Vec<JsonValue> = serde_json::from_str(&text)?;
        let retrieved_at = Utc::now();
        values
            .into_iter()
            .map(|value| record_from_value(value, self.source, retrieved_at))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ListingPage {
    #[serde(default)]
    page_count: Option<u32>,
    #[serde(default)]
    hits: Vec<ListingHit>,
}

#[derive(Debug, Clone, Deserialize)]
struct ListingHit {
    id: String,
}

/// Paged listing endpoint (`{page}` placeholder) plus per-event detail endpoint (`{id}`).
#[derive(Debug)]
pub struct JsonFeedFetcher {
    source: ItemSource,
    enabled: bool,
    listing_url: String,
    detail_url: String,
    http: Arc<HttpClient>,
}

/// Ids whose detail page should be requested, in listing order.
///
/// Duplicates are requested once; ids already stored are skipped unless `detailed`.
pub fn plan_detail_fetches(listed: &[String], existing: &[Item], detailed: bool) -> Vec<String> {
    let known: HashSet<&str> = existing.iter().map(|i| i.source_id.as_str()).collect();
    let mut seen = HashSet::new();
    listed
        .iter()
        .filter(|id| detailed || !known.contains(id.as_str()))
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

#[async_trait]
impl SourceFetcher for JsonFeedFetcher {
    fn source(&self) -> ItemSource {
        self.source
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn fetch(
        &self,
        existing: &[Item],
        detailed: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Item>, AdapterError> {
        let source = self.source.as_str();
        let mut listed = Vec::new();
        let mut page = 1u32;
        loop {
            let url = self.listing_url.replace("{page}", &page.to_string());
            let body = self.http.get(source, &url, cancel).await?;
            let listing: ListingPage = serde_json::from_slice(&body)?;
            listed.extend(listing.hits.into_iter().map(|hit| hit.id));
            match listing.page_count {
                Some(count) if page < count => page += 1,
                _ => break,
            }
        }

        let wanted = plan_detail_fetches(&listed, existing, detailed);
        info!(
            source,
            listed = listed.len(),
            wanted = wanted.len(),
            detailed,
            "listing fetched"
        );

        let mut items = Vec::with_capacity(wanted.len());
        for id in wanted {
            let url = self.detail_url.replace("{id}", &id);
            let body = match self.http.get(source, &url, cancel).await {
                Ok(body) => body,
                Err(AdapterError::Cancelled) => return Err(AdapterError::Cancelled),
                Err(err) => {
                    warn!(source, id = %id, error = %err, "detail fetch failed; skipping item");
                    continue;
                }
            };
            let value: JsonValue = match serde_json::from_slice(&body) {
                Ok(value) => value,
                Err(err) => {
                    warn!(source, id = %id, error = %err, "detail payload is not JSON; skipping item");
                    continue;
                }
            };
            match record_from_value(value, self.source, Utc::now()) {
                Ok(item) => items.push(item),
                Err(err) => warn!(source, id = %id, error = %err, "detail payload rejected"),
            }
        }
        Ok(items)
    }
}
