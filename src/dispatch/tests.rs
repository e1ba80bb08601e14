use super::*;
use serde_json::json;
use std::sync::Mutex;

/// Sink that reports every written batch (as its record count) on a channel.
struct RecordingSink {
    writes: mpsc::UnboundedSender<usize>,
    delay: Option<Duration>,
    fail: bool,
}

#[async_trait]
impl BulkSink for RecordingSink {
    async fn write(&self, body: String) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("sink unavailable");
        }
        let _ = self.writes.send(body.lines().count() / 2);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingObserver {
    reports: Mutex<Vec<FlushReport>>,
}

impl FlushObserver for RecordingObserver {
    fn on_flush(&self, report: &FlushReport) {
        self.reports.lock().unwrap().push(report.clone());
    }
}

fn settings(batch_size: usize) -> DispatcherSettings {
    DispatcherSettings {
        batch_size,
        idle_flush: Duration::from_secs(5),
        channel_capacity: 100,
        flush_timeout: Duration::from_secs(3),
    }
}

fn entry(n: usize) -> BulkEntry {
    BulkEntry::new("av-metrics", "metrics", json!({ "n": n }))
}

fn recording(
    batch_size: usize,
) -> (Dispatcher, mpsc::UnboundedReceiver<usize>, Arc<RecordingObserver>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = Arc::new(RecordingSink {
        writes: tx,
        delay: None,
        fail: false,
    });
    let observer = Arc::new(RecordingObserver::default());
    let dispatcher = Dispatcher::spawn(sink, observer.clone(), settings(batch_size));
    (dispatcher, rx, observer)
}

#[test]
fn test_ndjson_layout() {
    let entries = vec![entry(1), entry(2).with_id("abc")];
    let body = to_ndjson(&entries).unwrap();

    assert_eq!(
        body,
        concat!(
            "{\"index\":{\"_index\":\"av-metrics\",\"_type\":\"metrics\"}}\n",
            "{\"n\":1}\n",
            "{\"index\":{\"_index\":\"av-metrics\",\"_type\":\"metrics\",\"_id\":\"abc\"}}\n",
            "{\"n\":2}\n",
        )
    );
}

#[tokio::test(start_paused = true)]
async fn test_full_batch_flushes_once_and_disarms_timer() {
    let (dispatcher, mut writes, _observer) = recording(3);
    let sender = dispatcher.sender();

    for n in 0..3 {
        sender.send(entry(n)).await.unwrap();
    }

    assert_eq!(writes.recv().await, Some(3));

    // Nothing buffered, so the idle timer must not produce another flush.
    let extra = timeout(Duration::from_secs(60), writes.recv()).await;
    assert!(extra.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_idle_timer_flushes_partial_batch() {
    let (dispatcher, mut writes, observer) = recording(10);
    let sender = dispatcher.sender();
    let started = Instant::now();

    sender.send(entry(0)).await.unwrap();
    sender.send(entry(1)).await.unwrap();

    assert_eq!(writes.recv().await, Some(2));
    assert!(started.elapsed() >= Duration::from_secs(5));

    let extra = timeout(Duration::from_secs(60), writes.recv()).await;
    assert!(extra.is_err());

    let reports = observer.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].trigger, FlushTrigger::Idle);
    assert_eq!(reports[0].records, 2);
}

#[tokio::test(start_paused = true)]
async fn test_timer_rearms_after_flush() {
    let (dispatcher, mut writes, _observer) = recording(10);
    let sender = dispatcher.sender();

    sender.send(entry(0)).await.unwrap();
    assert_eq!(writes.recv().await, Some(1));

    sender.send(entry(1)).await.unwrap();
    sender.send(entry(2)).await.unwrap();
    assert_eq!(writes.recv().await, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_close_flushes_remainder() {
    let (dispatcher, mut writes, observer) = recording(10);
    let sender = dispatcher.sender();
    let started = Instant::now();

    for n in 0..4 {
        sender.send(entry(n)).await.unwrap();
    }
    drop(sender);

    let status = dispatcher.close().await;

    assert_eq!(writes.recv().await, Some(4));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(status.flushed_records, 4);
    assert_eq!(status.buffer_size, 0);
    assert_eq!(observer.reports.lock().unwrap()[0].trigger, FlushTrigger::Close);
}

#[tokio::test(start_paused = true)]
async fn test_failed_flush_is_reported_and_loop_continues() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let sink = Arc::new(RecordingSink {
        writes: tx,
        delay: None,
        fail: true,
    });
    let observer = Arc::new(RecordingObserver::default());
    let dispatcher = Dispatcher::spawn(sink, observer.clone(), settings(2));
    let sender = dispatcher.sender();

    for n in 0..4 {
        sender.send(entry(n)).await.unwrap();
    }
    drop(sender);
    let status = dispatcher.close().await;

    assert_eq!(status.flushed_batches, 2);
    assert_eq!(status.failed_batches, 2);
    assert_eq!(status.flushed_records, 0);

    let reports = observer.reports.lock().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports
        .iter()
        .all(|r| r.result.as_ref().unwrap_err().contains("sink unavailable")));
}

#[tokio::test(start_paused = true)]
async fn test_slow_sink_times_out_without_blocking_producer() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let sink = Arc::new(RecordingSink {
        writes: tx,
        delay: Some(Duration::from_secs(30)),
        fail: false,
    });
    let observer = Arc::new(RecordingObserver::default());
    let dispatcher = Dispatcher::spawn(sink, observer.clone(), settings(1));
    let sender = dispatcher.sender();

    // Each entry triggers its own flush; none of them waits on the sink.
    let started = Instant::now();
    for n in 0..5 {
        sender.send(entry(n)).await.unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    drop(sender);
    let status = dispatcher.close().await;

    assert_eq!(status.failed_batches, 5);
    let reports = observer.reports.lock().unwrap();
    assert!(reports
        .iter()
        .all(|r| r.result.as_ref().unwrap_err().contains("timed out")));
}

#[tokio::test(start_paused = true)]
async fn test_status_tracks_buffer() {
    let (dispatcher, _writes, _observer) = recording(10);
    let sender = dispatcher.sender();

    sender.send(entry(0)).await.unwrap();
    sender.send(entry(1)).await.unwrap();

    for _ in 0..100 {
        if dispatcher.status().buffer_size == 2 {
            break;
        }
        sleep(Duration::from_millis(1)).await;
    }

    let status = dispatcher.status();
    assert_eq!(status.buffer_size, 2);
    assert_eq!(status.channel_capacity, 100);
    assert_eq!(status.channel_utilization, 0);
}
