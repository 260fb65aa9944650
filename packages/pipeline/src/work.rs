//! Work units shared by every stage: dates, items, and run states.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PipelineError;

/// Calendar date identifying one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkDate(NaiveDate);

impl WorkDate {
    pub const FORMAT: &'static str = "%Y-%m-%d";

    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for WorkDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(Self::FORMAT))
    }
}

impl FromStr for WorkDate {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), Self::FORMAT)
            .map(WorkDate)
            .map_err(|e| {
                PipelineError::configuration(format!("invalid date {s:?} (expected YYYY-MM-DD): {e}"))
            })
    }
}

impl Serialize for WorkDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WorkDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One RSS entry to be fetched.
///
/// `id` is stable across runs for the same entry; it keys the batch map and
/// names every artifact derived from the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            title: None,
            published: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_published(mut self, published: impl Into<String>) -> Self {
        self.published = Some(published.into());
        self
    }
}

/// Ordered phases of one work date's run.
///
/// Declaration order is the progression order; `Ord` follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkState {
    #[default]
    Init,
    RssFetched,
    BatchesReady,
}

impl WorkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkState::Init => "INIT",
            WorkState::RssFetched => "RSS_FETCHED",
            WorkState::BatchesReady => "BATCHES_READY",
        }
    }

    /// States that require a published partition.
    pub fn requires_partition(&self) -> bool {
        *self >= WorkState::BatchesReady
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_date_round_trips_through_display() {
        let date: WorkDate = "2024-01-01".parse().unwrap();
        assert_eq!(date.to_string(), "2024-01-01");
        assert_eq!(serde_json::to_string(&date).unwrap(), "\"2024-01-01\"");
    }

    #[test]
    fn test_work_date_rejects_garbage() {
        let err = "01/01/2024".parse::<WorkDate>().unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_work_state_order() {
        assert!(WorkState::Init < WorkState::RssFetched);
        assert!(WorkState::RssFetched < WorkState::BatchesReady);
        assert_eq!(WorkState::default(), WorkState::Init);
        assert!(WorkState::BatchesReady.requires_partition());
        assert!(!WorkState::RssFetched.requires_partition());
    }

    #[test]
    fn test_work_state_wire_names() {
        let json = serde_json::to_string(&WorkState::BatchesReady).unwrap();
        assert_eq!(json, "\"BATCHES_READY\"");
        let state: WorkState = serde_json::from_str("\"RSS_FETCHED\"").unwrap();
        assert_eq!(state, WorkState::RssFetched);
    }
}
