use crate::config::{FeederConfig, JobConfig};
use crate::dispatch::BulkEntry;
use crate::error::Error;
use crate::feeder::{EventSource, Feeder, PageLimits, Window};
use crate::pipeline::checkpoint::CheckpointStore;
use crate::pipeline::{CaterpillarRegistry, RunContext};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// Builds the event source a job reads from.
pub trait SourceProvider: Send + Sync {
    fn source(&self, job: &JobConfig) -> Arc<dyn EventSource>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    InitialWaiting,
    Running,
    DoneWaiting,
    ErrorWaiting,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            state: JobState::InitialWaiting,
            last_run: None,
            last_error: None,
        }
    }
}

/// What one successful run did
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job_id: String,
    pub window: Window,
    pub count: u64,
    pub delivered: u64,
    pub entities: usize,
    pub last_event_time: Option<DateTime<Utc>>,
}

/// Runs jobs one at a time: checkpoint in, feed, caterpillar, checkpoint out.
pub struct JobRunner {
    registry: Arc<CaterpillarRegistry>,
    sources: Arc<dyn SourceProvider>,
    checkpoints: Arc<dyn CheckpointStore>,
    records: mpsc::Sender<BulkEntry>,
    feeder: FeederConfig,
    statuses: Mutex<HashMap<String, JobStatus>>,
}

impl JobRunner {
    pub fn new(
        registry: Arc<CaterpillarRegistry>,
        sources: Arc<dyn SourceProvider>,
        checkpoints: Arc<dyn CheckpointStore>,
        records: mpsc::Sender<BulkEntry>,
        feeder: FeederConfig,
    ) -> Self {
        Self {
            registry,
            sources,
            checkpoints,
            records,
            feeder,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Status of `job_id`; jobs that never ran are `initial-waiting`.
    pub fn status(&self, job_id: &str) -> JobStatus {
        self.statuses
            .lock()
            .map(|s| s.get(job_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Perform one run of `job`.
    ///
    /// The checkpoint is written once, after the caterpillar finished and the
    /// feeder delivered its whole window. Any failure leaves the previous
    /// checkpoint in place.
    pub async fn run_job(&self, job: &JobConfig) -> Result<RunSummary, Error> {
        let run_id = Uuid::now_v7();
        let span = info_span!("run", job = %job.id, run_id = %run_id);

        self.update(&job.id, |status| status.state = JobState::Running);

        let result = self.execute(job, run_id).instrument(span).await;

        self.update(&job.id, |status| {
            status.last_run = Some(Utc::now());
            match &result {
                Ok(_) => {
                    status.state = JobState::DoneWaiting;
                    status.last_error = None;
                }
                Err(e) => {
                    status.state = JobState::ErrorWaiting;
                    status.last_error = Some(e.to_string());
                }
            }
        });

        if let Err(e) = &result {
            error!(job = %job.id, run_id = %run_id, error = %e, kind = e.kind(), "Run failed");
        }
        result
    }

    async fn execute(&self, job: &JobConfig, run_id: Uuid) -> Result<RunSummary, Error> {
        job.validate()?;
        let caterpillar = self.registry.create(job)?;
        let template = job.load_query()?;

        let previous = self.checkpoints.get(&job.id)?.unwrap_or_default();
        let window = Window::resolve(
            job,
            previous.last_event_time,
            Utc::now(),
            Duration::minutes(self.feeder.buffer_interval_minutes),
        );

        let feeder = Feeder::new(
            self.sources.source(job),
            template,
            job.time_field.clone(),
            window,
            PageLimits::from(&self.feeder),
        )
        .with_scope(job.scope_key());

        let count = feeder.get_count().await?;
        if window.is_empty() {
            info!(start = %window.start, end = %window.end, error = %Error::OutOfWindow, "Nothing to feed");
        }
        let events = feeder.start_feeding(self.feeder.channel_capacity).await?;

        let ctx = RunContext {
            run_id,
            job: job.clone(),
            checkpoint: previous,
            events,
            records: self.records.clone(),
        };
        let mut checkpoint = caterpillar.run(ctx).await?;

        let status = feeder.status();
        if let Some(e) = status.error {
            return Err(Error::Query(format!(
                "feed stopped after {} of {} events: {}",
                status.sent, count, e
            )));
        }

        checkpoint.saved_at = Some(Utc::now());
        self.checkpoints.put(&job.id, &checkpoint)?;

        let summary = RunSummary {
            run_id,
            job_id: job.id.clone(),
            window,
            count,
            delivered: status.sent,
            entities: checkpoint.states.len(),
            last_event_time: checkpoint.last_event_time,
        };
        info!(
            count = summary.count,
            delivered = summary.delivered,
            entities = summary.entities,
            "Run complete"
        );
        Ok(summary)
    }

    fn update(&self, job_id: &str, apply: impl FnOnce(&mut JobStatus)) {
        let mut statuses = self
            .statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        apply(statuses.entry(job_id.to_string()).or_default());
    }
}
