//! Core domain model for evwatch: fetched items, fetch/send audit rows and saved queries.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "evwatch-core";

/// Upstream origin of event listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSource {
    Tekna,
    DntActivities,
}

impl ItemSource {
    pub const ALL: [ItemSource; 2] = [ItemSource::Tekna, ItemSource::DntActivities];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemSource::Tekna => "tekna",
            ItemSource::DntActivities => "dnt_activities",
        }
    }
}

impl fmt::Display for ItemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown item source `{0}`")]
pub struct UnknownSource(pub String);

impl FromStr for ItemSource {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemSource::ALL
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// Merge key of an item: unique per store.
pub type ItemKey = (ItemSource, String);

/// A single fetched event, course or activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub source: ItemSource,
    pub source_id: String,
    pub retrieved_at: DateTime<Utc>,
    pub event_start: DateTime<Utc>,
    pub event_end: DateTime<Utc>,
    pub enrollment_deadline: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub organizer: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub price: Option<String>,
    pub tags: Option<Vec<String>>,
    pub raw_data: Option<String>,
}

impl Item {
    pub fn key(&self) -> ItemKey {
        (self.source, self.source_id.clone())
    }

    /// Identity equality: both values describe the same logical event.
    ///
    /// Compares `source`, `title`, `source_id`, and `event_start`/`event_end` on their
    /// calendar date only.
    pub fn is_same_event(&self, other: &Item) -> bool {
        self.source == other.source
            && self.title == other.title
            && self.source_id == other.source_id
            && self.event_start.date_naive() == other.event_start.date_naive()
            && self.event_end.date_naive() == other.event_end.date_naive()
    }

    /// Full equality: identity equality plus exact event timestamps, `price`,
    /// `description`, `location`, `url`, and `enrollment_deadline` by date.
    pub fn is_fully_equal(&self, other: &Item) -> bool {
        self.is_same_event(other)
            && self.event_start == other.event_start
            && self.event_end == other.event_end
            && self.price == other.price
            && self.description == other.description
            && self.location == other.location
            && self.url == other.url
            && self.enrollment_deadline.map(|d| d.date_naive())
                == other.enrollment_deadline.map(|d| d.date_naive())
    }
}

/// Tag lists compare as ordered sequences; a missing list equals an empty one.
pub fn tags_equal(a: Option<&[String]>, b: Option<&[String]>) -> bool {
    a.unwrap_or_default() == b.unwrap_or_default()
}

/// One fetch attempt for one source in one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchHistory {
    pub source: ItemSource,
    pub execution_start: DateTime<Utc>,
    pub execution_duration: Duration,
    pub items_retrieved: usize,
    pub new_items: usize,
    pub updated_items: usize,
    pub is_detailed: bool,
    pub succeeded: bool,
}

impl FetchHistory {
    pub fn started(source: ItemSource, execution_start: DateTime<Utc>, is_detailed: bool) -> Self {
        Self {
            source,
            execution_start,
            execution_duration: Duration::ZERO,
            items_retrieved: 0,
            new_items: 0,
            updated_items: 0,
            is_detailed,
            succeeded: false,
        }
    }
}

/// One notification attempt for a saved query and recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendUpdateHistory {
    pub query_title: String,
    pub recipient_address: String,
    pub sent_at: DateTime<Utc>,
    pub new_items_count: usize,
    pub updated_items_count: usize,
}

/// Operator-authored read query over the item store with its subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedQuery {
    pub title: String,
    pub query_text: String,
    pub recipients: Vec<String>,
}

impl SavedQuery {
    pub fn has_title(&self, title: &str) -> bool {
        self.title.eq_ignore_ascii_case(title)
    }
}
