// Class-schedule lookup used to split metrics records at class boundaries

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One scheduled class in a room
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClassSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub catalog_number: String,
    #[serde(default)]
    pub credit_hours: f64,
    #[serde(default)]
    pub class_size: u32,
    #[serde(default)]
    pub enrollment: u32,
    #[serde(default)]
    pub instructor: String,
}

/// Source of class schedules.
#[async_trait]
pub trait ScheduleLookup: Send + Sync {
    /// Classes in `room_id` overlapping `[start, end]`
    async fn classes(
        &self,
        room_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ClassSlot>>;
}

/// Used when no schedule service is configured: no room has classes.
pub struct NoSchedule;

#[async_trait]
impl ScheduleLookup for NoSchedule {
    async fn classes(
        &self,
        _room_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<ClassSlot>> {
        Ok(Vec::new())
    }
}

/// HTTP client for the class-schedule service.
///
/// Calls `GET {base}/rooms/{room}/schedule?start=..&end=..`.
pub struct HttpScheduleLookup {
    http_client: Client,
    base_url: String,
}

impl HttpScheduleLookup {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent("caterpillar/0.1")
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ScheduleLookup for HttpScheduleLookup {
    async fn classes(
        &self,
        room_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ClassSlot>> {
        let url = format!(
            "{}/rooms/{}/schedule?start={}&end={}",
            self.base_url,
            urlencoding::encode(room_id),
            urlencoding::encode(&start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            urlencoding::encode(&end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .context("Failed to send schedule request")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Schedule service error for room {}: {}", room_id, status));
        }

        response
            .json::<Vec<ClassSlot>>()
            .await
            .context("Failed to parse schedule response")
    }
}
