use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Serialize, Serializer};

/// MediaWiki renders every timestamp as ISO-8601 UTC with a literal `Z`.
pub const WIKI_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Edit,
    Categorize,
    Log,
    New,
    Other(String),
}

impl ChangeType {
    pub fn parse(value: &str) -> Self {
        match value {
            "edit" => Self::Edit,
            "categorize" => Self::Categorize,
            "log" => Self::Log,
            "new" => Self::New,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Edit => "edit",
            Self::Categorize => "categorize",
            Self::Log => "log",
            Self::New => "new",
            Self::Other(value) => value,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ChangeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One observed change event as ingested from `list=recentchanges`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditRecord {
    pub change_type: ChangeType,
    pub title: String,
    pub user: Option<String>,
    pub user_id: Option<String>,
    #[serde(serialize_with = "serialize_optional_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    pub comment: String,
}

/// Half-open bucket `[window_start, window_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlidingWindow {
    #[serde(serialize_with = "serialize_timestamp")]
    pub window_start: DateTime<Utc>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub window_end: DateTime<Utc>,
}

impl SlidingWindow {
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.window_start <= timestamp && timestamp < self.window_end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowActivity {
    #[serde(serialize_with = "serialize_timestamp")]
    pub window_start: DateTime<Utc>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub window_end: DateTime<Utc>,
    pub changes_count: u64,
    pub unique_users: u64,
}

pub fn format_wiki_timestamp(value: &DateTime<Utc>) -> String {
    value.format(WIKI_TIMESTAMP_FORMAT).to_string()
}

/// Accepts the canonical MediaWiki form and any RFC 3339 timestamp.
pub fn parse_wiki_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, WIKI_TIMESTAMP_FORMAT) {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn serialize_timestamp<S: Serializer>(
    value: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_wiki_timestamp(value))
}

fn serialize_optional_timestamp<S: Serializer>(
    value: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => serialize_timestamp(value, serializer),
        None => serializer.serialize_none(),
    }
}
