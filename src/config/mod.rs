use crate::error::Error;
use crate::event::ScopeKey;
use crate::feeder::QueryTemplate;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Key in `type_config` naming the index metrics records are written to
pub const OUTPUT_INDEX: &str = "output-index";

/// Complete Caterpillar configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaterpillarConfig {
    #[serde(default)]
    pub elastic: ElasticConfig,
    #[serde(default)]
    pub feeder: FeederConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Event store / bulk sink connection
#[derive(Debug, Clone, Deserialize)]
pub struct ElasticConfig {
    #[serde(default = "default_elastic_url")]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Per-request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub timeout_seconds: u64,
}

fn default_elastic_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_request_timeout() -> u64 {
    3
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: default_elastic_url(),
            username: None,
            password: None,
            timeout_seconds: default_request_timeout(),
        }
    }
}

/// Feeder paging limits
#[derive(Debug, Clone, Deserialize)]
pub struct FeederConfig {
    /// Upstream result cap for a single page
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    /// Safety margin subtracted from "now" for the window end (minutes)
    #[serde(default = "default_buffer_interval")]
    pub buffer_interval_minutes: i64,
    /// Maximum number of times an overflowing page is halved
    #[serde(default = "default_max_split_depth")]
    pub max_split_depth: usize,
    /// Capacity of the feeder -> engine event channel
    #[serde(default = "default_feeder_capacity")]
    pub channel_capacity: usize,
}

fn default_max_page_size() -> usize {
    10000
}

fn default_buffer_interval() -> i64 {
    10
}

fn default_max_split_depth() -> usize {
    32
}

fn default_feeder_capacity() -> usize {
    1000
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
            buffer_interval_minutes: default_buffer_interval(),
            max_split_depth: default_max_split_depth(),
            channel_capacity: default_feeder_capacity(),
        }
    }
}

/// Buffering dispatcher triggers
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_idle_flush")]
    pub idle_flush_seconds: u64,
    #[serde(default = "default_dispatch_capacity")]
    pub channel_capacity: usize,
    /// Upper bound on a single detached flush (seconds)
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_seconds: u64,
}

fn default_batch_size() -> usize {
    2500
}

fn default_idle_flush() -> u64 {
    5
}

fn default_dispatch_capacity() -> usize {
    10000
}

fn default_flush_timeout() -> u64 {
    3
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            idle_flush_seconds: default_idle_flush(),
            channel_capacity: default_dispatch_capacity(),
            flush_timeout_seconds: default_flush_timeout(),
        }
    }
}

/// Checkpoint persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("/var/lib/caterpillar/checkpoints")
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_dir(),
        }
    }
}

/// Device/room catalog source
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,
}

/// Class-schedule service; unset disables class splitting
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub url: Option<String>,
}

/// One configured pipeline job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub id: String,

    /// Registry name of the caterpillar to run
    #[serde(rename = "type")]
    pub job_type: String,

    /// Index the events are read from
    #[serde(default)]
    pub index: String,

    /// Inline query template
    #[serde(default)]
    pub query: Option<serde_json::Value>,

    /// Path to a JSON query template, used when `query` is absent
    #[serde(default)]
    pub query_file: Option<PathBuf>,

    /// Cron expression, read by the external scheduler only
    #[serde(default)]
    pub interval: Option<String>,

    /// Look-back limit for a job without a checkpoint (minutes)
    #[serde(default)]
    pub max_interval_minutes: Option<i64>,

    #[serde(default)]
    pub time_field: String,

    /// Scope field name (`deviceid`, `roomid`, `buildingid`)
    #[serde(default = "default_scope")]
    pub scope: String,

    #[serde(default)]
    pub type_config: HashMap<String, String>,

    #[serde(default)]
    pub absolute_start: Option<DateTime<Utc>>,

    #[serde(default)]
    pub absolute_end: Option<DateTime<Utc>>,
}

fn default_scope() -> String {
    "deviceid".to_string()
}

impl JobConfig {
    /// Check the settings a run needs before it starts feeding.
    pub fn validate(&self) -> Result<(), Error> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidConfig("job id is empty".to_string()));
        }

        if self.query.is_none() && self.query_file.is_none() {
            return Err(Error::InvalidConfig(format!(
                "job '{}' has neither query nor query_file",
                self.id
            )));
        }

        if self.time_field.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "job '{}' has no time_field",
                self.id
            )));
        }

        if self.output_index().is_none() {
            return Err(Error::InvalidConfig(format!(
                "job '{}' is missing type_config.{}",
                self.id, OUTPUT_INDEX
            )));
        }

        match (self.absolute_start, self.absolute_end) {
            (Some(_), None) => Err(Error::InvalidConfig(format!(
                "job '{}' sets absolute_start without absolute_end",
                self.id
            ))),
            (Some(start), Some(end)) if start >= end => Err(Error::InvalidConfig(format!(
                "job '{}' absolute_start is not before absolute_end",
                self.id
            ))),
            _ => Ok(()),
        }
    }

    pub fn output_index(&self) -> Option<&str> {
        self.type_config
            .get(OUTPUT_INDEX)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn scope_key(&self) -> ScopeKey {
        ScopeKey::from_name(&self.scope)
    }

    /// Load the job's query template, inline first, then from file.
    pub fn load_query(&self) -> Result<QueryTemplate, Error> {
        let parsed = match (&self.query, &self.query_file) {
            (Some(inline), _) => QueryTemplate::from_value(inline.clone()),
            (None, Some(path)) => QueryTemplate::from_file(path),
            (None, None) => {
                return Err(Error::InvalidConfig(format!(
                    "job '{}' has neither query nor query_file",
                    self.id
                )))
            }
        };

        parsed.map_err(|e| Error::InvalidConfig(format!("job '{}': {:#}", self.id, e)))
    }
}

impl CaterpillarConfig {
    /// Replace connection settings with values from the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("CATERPILLAR_ELASTIC_URL") {
            self.elastic.url = url;
        }
        if let Some(username) = lookup("CATERPILLAR_ELASTIC_USERNAME") {
            self.elastic.username = Some(username);
        }
        if let Some(password) = lookup("CATERPILLAR_ELASTIC_PASSWORD") {
            self.elastic.password = Some(password);
        }
    }

    pub fn job(&self, id: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

/// Load configuration from TOML file, then apply environment overrides
pub fn load_config(path: &str) -> Result<CaterpillarConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let mut config: CaterpillarConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config {}", path))?;
    config.apply_env_overrides();
    Ok(config)
}
