// Buffering dispatcher: batches records and ships them to the bulk sink on a
// size or idle trigger, without waiting for the write to finish.

use crate::config::DispatchConfig;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

/// One record addressed to an index, as written to the bulk endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkEntry {
    pub header: BulkHeader,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkHeader {
    pub index: HeaderIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaderIndex {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_type")]
    pub doc_type: String,
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl BulkEntry {
    pub fn new(index: impl Into<String>, doc_type: impl Into<String>, body: Value) -> Self {
        Self {
            header: BulkHeader {
                index: HeaderIndex {
                    index: index.into(),
                    doc_type: doc_type.into(),
                    id: None,
                },
            },
            body,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.header.index.id = Some(id.into());
        self
    }
}

/// Serialize entries as a bulk body: one header line and one body line each.
pub fn to_ndjson(entries: &[BulkEntry]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(&entry.header)?);
        out.push('\n');
        out.push_str(&serde_json::to_string(&entry.body)?);
        out.push('\n');
    }
    Ok(out)
}

/// Destination of flushed batches.
#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Write one newline-delimited bulk body. Success or failure covers the
    /// whole batch.
    async fn write(&self, body: String) -> anyhow::Result<()>;
}

/// What caused a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushTrigger {
    Size,
    Idle,
    Close,
}

/// Outcome of one detached flush
#[derive(Debug, Clone)]
pub struct FlushReport {
    pub trigger: FlushTrigger,
    pub records: usize,
    pub elapsed: Duration,
    pub result: Result<(), String>,
}

/// Hook notified after every flush, successful or not.
pub trait FlushObserver: Send + Sync {
    fn on_flush(&self, report: &FlushReport);
}

/// Default observer: logs each flush.
pub struct LogObserver;

impl FlushObserver for LogObserver {
    fn on_flush(&self, report: &FlushReport) {
        match &report.result {
            Ok(()) => info!(
                records = report.records,
                trigger = ?report.trigger,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Flushed batch"
            ),
            Err(e) => error!(
                records = report.records,
                trigger = ?report.trigger,
                error = %e,
                "Flush failed, batch dropped"
            ),
        }
    }
}

/// Dispatcher thresholds
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub batch_size: usize,
    pub idle_flush: Duration,
    pub channel_capacity: usize,
    pub flush_timeout: Duration,
}

impl From<&DispatchConfig> for DispatcherSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            idle_flush: Duration::from_secs(config.idle_flush_seconds),
            channel_capacity: config.channel_capacity.max(1),
            flush_timeout: Duration::from_secs(config.flush_timeout_seconds),
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

/// Point-in-time view of the dispatcher
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub channel_capacity: usize,
    /// Entries waiting in the inbound channel
    pub channel_utilization: usize,
    /// Entries buffered for the next flush
    pub buffer_size: usize,
    pub flushed_batches: usize,
    pub flushed_records: usize,
    pub failed_batches: usize,
}

#[derive(Default)]
struct Counters {
    buffer_size: AtomicUsize,
    flushed_batches: AtomicUsize,
    flushed_records: AtomicUsize,
    failed_batches: AtomicUsize,
}

/// Running dispatcher: the inbound channel plus its consumer task.
pub struct Dispatcher {
    sender: mpsc::Sender<BulkEntry>,
    capacity: usize,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    /// Start the consumer loop on the current runtime.
    pub fn spawn(
        sink: Arc<dyn BulkSink>,
        observer: Arc<dyn FlushObserver>,
        settings: DispatcherSettings,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(settings.channel_capacity);
        let counters = Arc::new(Counters::default());
        let capacity = settings.channel_capacity;

        let consumer = Consumer {
            receiver,
            sink,
            observer,
            buffer: Vec::with_capacity(settings.batch_size),
            settings,
            flushes: JoinSet::new(),
            counters: Arc::clone(&counters),
        };

        let task = tokio::spawn(consumer.run());

        Self {
            sender,
            capacity,
            counters,
            task,
        }
    }

    /// Producer side of the inbound channel
    pub fn sender(&self) -> mpsc::Sender<BulkEntry> {
        self.sender.clone()
    }

    pub fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            channel_capacity: self.capacity,
            channel_utilization: self.capacity.saturating_sub(self.sender.capacity()),
            buffer_size: self.counters.buffer_size.load(Ordering::Relaxed),
            flushed_batches: self.counters.flushed_batches.load(Ordering::Relaxed),
            flushed_records: self.counters.flushed_records.load(Ordering::Relaxed),
            failed_batches: self.counters.failed_batches.load(Ordering::Relaxed),
        }
    }

    /// Close the inbound channel and wait for the final flush.
    ///
    /// Returns once every sender clone is dropped and outstanding flushes
    /// have completed or timed out.
    pub async fn close(self) -> DispatcherStatus {
        let Dispatcher {
            sender,
            capacity,
            counters,
            task,
        } = self;
        drop(sender);

        if let Err(e) = task.await {
            error!(error = %e, "Dispatcher task failed");
        }

        DispatcherStatus {
            channel_capacity: capacity,
            channel_utilization: 0,
            buffer_size: counters.buffer_size.load(Ordering::Relaxed),
            flushed_batches: counters.flushed_batches.load(Ordering::Relaxed),
            flushed_records: counters.flushed_records.load(Ordering::Relaxed),
            failed_batches: counters.failed_batches.load(Ordering::Relaxed),
        }
    }
}

struct Consumer {
    receiver: mpsc::Receiver<BulkEntry>,
    sink: Arc<dyn BulkSink>,
    observer: Arc<dyn FlushObserver>,
    buffer: Vec<BulkEntry>,
    settings: DispatcherSettings,
    flushes: JoinSet<()>,
    counters: Arc<Counters>,
}

impl Consumer {
    async fn run(mut self) {
        let idle = sleep(self.settings.idle_flush);
        tokio::pin!(idle);
        let mut armed = false;

        loop {
            tokio::select! {
                received = self.receiver.recv() => {
                    let Some(entry) = received else {
                        self.flush(FlushTrigger::Close);
                        break;
                    };

                    if self.buffer.is_empty() {
                        idle.as_mut().reset(Instant::now() + self.settings.idle_flush);
                        armed = true;
                    }
                    self.buffer.push(entry);
                    self.counters.buffer_size.store(self.buffer.len(), Ordering::Relaxed);

                    if self.buffer.len() >= self.settings.batch_size {
                        armed = false;
                        self.flush(FlushTrigger::Size);
                    }
                }
                () = &mut idle, if armed => {
                    armed = false;
                    self.flush(FlushTrigger::Idle);
                }
                Some(joined) = self.flushes.join_next(), if !self.flushes.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Flush task panicked");
                    }
                }
            }
        }

        while let Some(joined) = self.flushes.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Flush task panicked");
            }
        }
        debug!("Dispatcher stopped");
    }

    /// Hand the buffered batch to a detached flush task.
    fn flush(&mut self, trigger: FlushTrigger) {
        if self.buffer.is_empty() {
            return;
        }

        let batch = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.settings.batch_size),
        );
        self.counters.buffer_size.store(0, Ordering::Relaxed);
        debug!(records = batch.len(), trigger = ?trigger, "Spawning flush");

        let sink = Arc::clone(&self.sink);
        let observer = Arc::clone(&self.observer);
        let counters = Arc::clone(&self.counters);
        let limit = self.settings.flush_timeout;

        self.flushes.spawn(async move {
            let started = Instant::now();
            let result = write_batch(sink.as_ref(), &batch, limit).await;

            counters.flushed_batches.fetch_add(1, Ordering::Relaxed);
            match &result {
                Ok(()) => {
                    counters
                        .flushed_records
                        .fetch_add(batch.len(), Ordering::Relaxed);
                }
                Err(_) => {
                    counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                }
            }

            observer.on_flush(&FlushReport {
                trigger,
                records: batch.len(),
                elapsed: started.elapsed(),
                result,
            });
        });
    }
}

async fn write_batch(sink: &dyn BulkSink, batch: &[BulkEntry], limit: Duration) -> Result<(), String> {
    let body = to_ndjson(batch).map_err(|e| format!("failed to serialize batch: {}", e))?;

    match timeout(limit, sink.write(body)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => {
            warn!(records = batch.len(), timeout_ms = limit.as_millis() as u64, "Flush timed out");
            Err(format!("flush timed out after {}ms", limit.as_millis()))
        }
    }
}
