// Display-state metrics: the power/input/blank graph, its callbacks and the
// caterpillar that drives it

mod actions;
mod enrich;
mod graph;
mod record;
mod store;

#[cfg(test)]
mod tests;

pub use actions::{DisplayAction, DisplayStep};
pub use enrich::{split_by_classes, Enricher};
pub use graph::{display_graph, BLANK, INPUT_ACTIVE, POWER_ON, POWER_STANDBY, START};
pub use record::{ClassInfo, MetricsRecord, RecordType};
pub use store::DisplayState;

use crate::directory::Directory;
use crate::dispatch::BulkEntry;
use crate::error::Error;
use crate::pipeline::{Caterpillar, CaterpillarRegistry, Checkpoint, RunContext};
use crate::schedule::ScheduleLookup;
use crate::state::{Forward, Graph, StateMachine};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Registry name of the display-state job type
pub const DISPLAY_STATE: &str = "display-state";

/// Document type written in bulk headers
pub const METRICS_DOC_TYPE: &str = "metrics";

/// Wraps records for the dispatcher, dropping zero-width ones.
pub struct RecordForwarder {
    index: String,
    sender: mpsc::Sender<BulkEntry>,
}

impl RecordForwarder {
    pub fn new(index: impl Into<String>, sender: mpsc::Sender<BulkEntry>) -> Self {
        Self {
            index: index.into(),
            sender,
        }
    }
}

#[async_trait]
impl Forward<MetricsRecord> for RecordForwarder {
    async fn forward(&self, records: Vec<MetricsRecord>) {
        for record in records {
            if record.elapsed_in_seconds < 1 {
                debug!(
                    record_type = %record.record_type,
                    device = %record.device.id,
                    subject = %record.subject(),
                    "Dropping record shorter than one second"
                );
                continue;
            }

            let body = match serde_json::to_value(&record) {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, device = %record.device.id, "Failed to serialize record");
                    continue;
                }
            };

            let entry = BulkEntry::new(self.index.as_str(), METRICS_DOC_TYPE, body);
            if self.sender.send(entry).await.is_err() {
                warn!(index = %self.index, "Dispatcher closed, dropping records");
                return;
            }
        }
    }
}

/// Tracks time spent per power state, input and blank state of each display.
pub struct DisplayStateCaterpillar {
    graph: Arc<Graph<DisplayState, MetricsRecord>>,
}

impl DisplayStateCaterpillar {
    pub fn new(directory: Arc<Directory>, schedule: Arc<dyn ScheduleLookup>) -> Result<Self, Error> {
        let enricher = Arc::new(Enricher::new(directory, schedule));
        Ok(Self {
            graph: Arc::new(display_graph(enricher)?),
        })
    }

    pub fn graph(&self) -> &Graph<DisplayState, MetricsRecord> {
        &self.graph
    }

    /// Register the display-state type, sharing `directory` and `schedule`
    /// between every job of that type.
    pub fn register(
        registry: &mut CaterpillarRegistry,
        directory: Arc<Directory>,
        schedule: Arc<dyn ScheduleLookup>,
    ) {
        registry.register(DISPLAY_STATE, move |_job| {
            let caterpillar: Box<dyn Caterpillar> =
                Box::new(Self::new(Arc::clone(&directory), Arc::clone(&schedule))?);
            Ok(caterpillar)
        });
    }
}

#[async_trait]
impl Caterpillar for DisplayStateCaterpillar {
    async fn run(&self, ctx: RunContext) -> Result<Checkpoint, Error> {
        let RunContext {
            run_id,
            job,
            mut checkpoint,
            mut events,
            records,
        } = ctx;

        let index = job.output_index().ok_or_else(|| {
            Error::InvalidConfig(format!("job '{}' has no output index", job.id))
        })?;
        let forwarder = RecordForwarder::new(index, records);

        let states = checkpoint.decode_states::<DisplayState>()?;
        let mut machine = StateMachine::with_states(Arc::clone(&self.graph), job.scope_key(), states);

        let mut processed = 0u64;
        let mut failed = 0u64;

        while let Some(event) = events.recv().await {
            processed += 1;
            match machine.process_event(&event, &forwarder).await {
                Ok(()) => checkpoint.observe(event.timestamp),
                Err(e) => {
                    failed += 1;
                    error!(
                        entity = %event.entity_id,
                        key = %event.key,
                        value = %event.value,
                        timestamp = %event.timestamp,
                        kind = e.kind(),
                        error = %e,
                        "Failed to process event"
                    );
                }
            }
        }

        info!(
            run_id = %run_id,
            events = processed,
            failed,
            entities = machine.states().len(),
            "Event stream drained"
        );

        checkpoint.set_states(machine.states())?;
        Ok(checkpoint)
    }
}
