// Pipeline glue: caterpillar registry, checkpoints and the per-job run flow

mod checkpoint;
mod runner;


pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use runner::{JobRunner, JobState, JobStatus, RunSummary, SourceProvider};

use crate::config::JobConfig;
use crate::dispatch::BulkEntry;
use crate::error::Error;
use crate::event::Event;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Everything one run of a caterpillar consumes.
pub struct RunContext {
    pub run_id: Uuid,
    pub job: JobConfig,
    /// Checkpoint left by the previous successful run (default when none)
    pub checkpoint: Checkpoint,
    /// Events of the run's window, ascending by timestamp
    pub events: mpsc::Receiver<Event>,
    /// Dispatcher inbound channel
    pub records: mpsc::Sender<BulkEntry>,
}

/// A job type: drains a run's events and returns the checkpoint to persist.
#[async_trait]
pub trait Caterpillar: Send + Sync {
    async fn run(&self, ctx: RunContext) -> Result<Checkpoint, Error>;
}

type Factory = Box<dyn Fn(&JobConfig) -> Result<Box<dyn Caterpillar>, Error> + Send + Sync>;

/// Maps job `type` names to caterpillar factories.
///
/// Built at startup and handed to the [`JobRunner`].
#[derive(Default)]
pub struct CaterpillarRegistry {
    factories: HashMap<String, Factory>,
}

impl CaterpillarRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&JobConfig) -> Result<Box<dyn Caterpillar>, Error> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Build the caterpillar for `job`. Unknown types are `invalid-config`.
    pub fn create(&self, job: &JobConfig) -> Result<Box<dyn Caterpillar>, Error> {
        let factory = self.factories.get(&job.job_type).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "job '{}' has unknown type '{}'",
                job.id, job.job_type
            ))
        })?;
        factory(job)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
