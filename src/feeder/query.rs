use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;

/// Query template configured per job.
///
/// Templates must not carry their own time range: the feeder appends a
/// `range` filter on the job's time field for every page it requests.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryTemplate {
    #[serde(default)]
    pub query: QueryDsl,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggs: Option<Value>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub from: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<Value>,
    #[serde(rename = "_source", skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDsl {
    #[serde(default)]
    pub bool: BoolQuery,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoolQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub must: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub should: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub must_not: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_should_match: Option<Value>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl QueryTemplate {
    /// Load a template from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read query file {}", path.display()))?;
        Self::from_json(&contents)
    }

    /// Parse a template from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse query template")
    }

    /// Convert an inline (already parsed) query value into a template
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("Failed to parse inline query template")
    }

    /// Copy of this template restricted to `[start, end)` on `time_field`.
    ///
    /// Bounds keep the full sub-second precision of `start` and `end`.
    pub fn with_time_range(&self, time_field: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let mut range = Map::new();
        range.insert(
            time_field.to_string(),
            json!({
                "gte": start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                "lt": end.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            }),
        );

        let mut query = self.clone();
        query.query.bool.filter.push(json!({ "range": range }));
        query
    }

    /// Search body for one page: time-bounded, sorted ascending on the time
    /// field, capped at `max_page_size` hits.
    pub fn page(
        &self,
        time_field: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_page_size: usize,
    ) -> Self {
        let mut query = self.with_time_range(time_field, start, end);
        query.from = 0;
        query.size = max_page_size;
        query.sort = vec![json!({ time_field: "asc" })];
        query
    }

    /// Body accepted by the `_count` endpoint (query clause only).
    pub fn count_body(&self) -> Value {
        json!({ "query": self.query })
    }
}

/// Response of the `_count` endpoint
#[derive(Debug, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

/// Response of the `_search` endpoint, trimmed to what the feeder reads
#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub took: u64,
    #[serde(default)]
    pub timed_out: bool,
    pub hits: Hits,
}

#[derive(Debug, Deserialize)]
pub struct Hits {
    pub total: HitTotal,
    #[serde(default)]
    pub hits: Vec<Hit>,
}

/// Older stores report the total as a number, newer ones as an object.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum HitTotal {
    Count(u64),
    Object { value: u64 },
}

impl HitTotal {
    pub fn value(&self) -> u64 {
        match self {
            HitTotal::Count(n) => *n,
            HitTotal::Object { value } => *value,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Hit {
    #[serde(rename = "_index", default)]
    pub index: String,
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_source", default)]
    pub source: Value,
}
