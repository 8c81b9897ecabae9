use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// How the action handler surfaces execution failures to its caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Failures propagate as `Err` from `process_action`.
    Throw,
    /// Failures are captured into the returned result's `error` field.
    #[default]
    Callback,
}

impl fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStrategy::Throw => write!(f, "throw"),
            ErrorStrategy::Callback => write!(f, "callback"),
        }
    }
}

/// Where a navigation opens its target URL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NavigationTarget {
    /// Replace the current view.
    #[default]
    #[serde(rename = "_self")]
    SameTab,
    /// Open a new tab or window.
    #[serde(rename = "_blank")]
    NewTab,
}

impl NavigationTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            NavigationTarget::SameTab => "_self",
            NavigationTarget::NewTab => "_blank",
        }
    }
}

impl fmt::Display for NavigationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NavigationTarget {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "_self" => Ok(NavigationTarget::SameTab),
            "_blank" => Ok(NavigationTarget::NewTab),
            _ => Err(format!("Unknown navigation target: {}", s)),
        }
    }
}

// =============================================================================
// Value Objects
// =============================================================================

/// Milliseconds since the Unix epoch, UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }

    /// Milliseconds elapsed since this timestamp, saturating at zero.
    pub fn age_ms(&self) -> u64 {
        (Timestamp::now().0 - self.0).max(0) as u64
    }
}

/// A search result the user selected.
///
/// Only `id` and `title` are required; `url` drives navigation and
/// `metadata` carries whatever the search backend attached (scores,
/// result counts, facets).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl SearchResult {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            url: None,
            description: None,
            metadata: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }

    /// Look up a metadata entry by key.
    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}
