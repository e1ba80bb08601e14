// Windowed adaptive feeder: pages events out of the event store in
// time-bounded slices sized to stay under the store's result cap.

use crate::config::FeederConfig;
use crate::error::Error;
use crate::event::{validate, Event, ScopeKey};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, error, info, warn, Instrument, Span};

mod query;
mod window;


pub use query::{BoolQuery, CountResponse, Hit, HitTotal, Hits, QueryDsl, QueryTemplate, SearchResponse};
pub use window::{page_duration, Window};

/// Store the feeder pulls events from.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Number of documents matching `query`
    async fn count(&self, query: &QueryTemplate) -> anyhow::Result<u64>;

    /// One page of documents matching `query`, in the query's sort order
    async fn search(&self, query: &QueryTemplate) -> anyhow::Result<SearchPage>;
}

/// Hits returned by one search, plus the store's total for the same query.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub total: u64,
    pub hits: Vec<Value>,
}

impl SearchPage {
    /// The store returned fewer hits than matched.
    pub fn is_truncated(&self) -> bool {
        self.total > self.hits.len() as u64
    }
}

/// Page size cap and bisection bound
#[derive(Debug, Clone, Copy)]
pub struct PageLimits {
    pub max_page_size: usize,
    pub max_split_depth: usize,
}

impl From<&FeederConfig> for PageLimits {
    fn from(config: &FeederConfig) -> Self {
        Self {
            max_page_size: config.max_page_size,
            max_split_depth: config.max_split_depth,
        }
    }
}

/// Progress of one feeder
#[derive(Debug, Clone, Serialize)]
pub struct FeederStatus {
    pub window: Window,
    pub count: Option<u64>,
    pub sent: u64,
    pub cursor: DateTime<Utc>,
    pub finished: bool,
    /// Set when a page failed and the stream was closed early
    pub error: Option<String>,
}

/// Pulls the events of one window out of an [`EventSource`].
pub struct Feeder {
    source: Arc<dyn EventSource>,
    template: QueryTemplate,
    time_field: String,
    window: Window,
    limits: PageLimits,
    scope: ScopeKey,
    count: OnceCell<u64>,
    status: Arc<Mutex<FeederStatus>>,
}

impl Feeder {
    pub fn new(
        source: Arc<dyn EventSource>,
        template: QueryTemplate,
        time_field: impl Into<String>,
        window: Window,
        limits: PageLimits,
    ) -> Self {
        let status = FeederStatus {
            window,
            count: None,
            sent: 0,
            cursor: window.start,
            finished: false,
            error: None,
        };

        Self {
            source,
            template,
            time_field: time_field.into(),
            window,
            limits,
            scope: ScopeKey::Device,
            count: OnceCell::new(),
            status: Arc::new(Mutex::new(status)),
        }
    }

    /// Scope the job keys its machines by; hits missing that id are skipped.
    pub fn with_scope(mut self, scope: ScopeKey) -> Self {
        self.scope = scope;
        self
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn status(&self) -> FeederStatus {
        lock(&self.status).clone()
    }

    /// Number of events in the window.
    ///
    /// Issues one count query on first call; later calls return the same
    /// value. An empty window counts 0 without querying.
    pub async fn get_count(&self) -> Result<u64, Error> {
        let count = self
            .count
            .get_or_try_init(|| async {
                if self.window.is_empty() {
                    return Ok(0);
                }

                let query =
                    self.template
                        .with_time_range(&self.time_field, self.window.start, self.window.end);
                self.source
                    .count(&query)
                    .await
                    .map_err(|e| Error::Query(format!("{:#}", e)))
            })
            .await?;

        lock(&self.status).count = Some(*count);
        Ok(*count)
    }

    /// Start paging the window into a bounded channel.
    ///
    /// The first page is fetched before returning so a broken query fails
    /// the caller directly. Later page failures are logged and close the
    /// stream. The stream also closes once every counted event was sent or
    /// the cursor reaches the window end.
    pub async fn start_feeding(&self, capacity: usize) -> Result<mpsc::Receiver<Event>, Error> {
        let count = self.get_count().await?;
        let (tx, rx) = mpsc::channel(capacity.max(1));

        if count == 0 {
            info!(
                start = %self.window.start,
                end = %self.window.end,
                "No events in window"
            );
            lock(&self.status).finished = true;
            return Ok(rx);
        }

        let page_len = page_duration(count, self.limits.max_page_size, self.window.span());
        info!(
            count,
            start = %self.window.start,
            end = %self.window.end,
            page_seconds = page_len.num_seconds(),
            "Starting feed"
        );

        let mut pager = Pager {
            source: Arc::clone(&self.source),
            template: self.template.clone(),
            time_field: self.time_field.clone(),
            end: self.window.end,
            cursor: self.window.start,
            page_len,
            limits: self.limits,
            scope: self.scope,
            sent: 0,
            status: Arc::clone(&self.status),
        };

        let first = pager.next_page().await?;
        tokio::spawn(pager.feed(first, count, tx).instrument(Span::current()));

        Ok(rx)
    }
}

/// Paging cursor owned by the feed task.
struct Pager {
    source: Arc<dyn EventSource>,
    template: QueryTemplate,
    time_field: String,
    end: DateTime<Utc>,
    cursor: DateTime<Utc>,
    page_len: Duration,
    limits: PageLimits,
    scope: ScopeKey,
    sent: u64,
    status: Arc<Mutex<FeederStatus>>,
}

impl Pager {
    async fn feed(mut self, mut page: Option<Vec<Event>>, count: u64, tx: mpsc::Sender<Event>) {
        while let Some(events) = page.take() {
            for event in events {
                if tx.send(event).await.is_err() {
                    debug!("Event receiver dropped, stopping feed");
                    self.finish();
                    return;
                }
                self.sent += 1;
            }
            self.report();

            if self.sent >= count {
                info!(sent = self.sent, "All counted events delivered");
                break;
            }

            page = match self.next_page().await {
                Ok(next) => next,
                Err(e) => {
                    error!(
                        error = %e,
                        kind = e.kind(),
                        cursor = %self.cursor,
                        sent = self.sent,
                        "Feeder page failed, closing stream"
                    );
                    lock(&self.status).error = Some(e.to_string());
                    break;
                }
            };
        }

        if self.cursor >= self.end {
            debug!(error = %Error::OutOfWindow, "Cursor reached window end");
        }
        self.finish();
    }

    /// Fetch the next page and advance the cursor past it.
    ///
    /// `Ok(None)` once the cursor has reached the window end.
    async fn next_page(&mut self) -> Result<Option<Vec<Event>>, Error> {
        if self.cursor >= self.end {
            return Ok(None);
        }

        let start = self.cursor;
        let end = (start + self.page_len).min(self.end);
        let page = self.search(start, end).await?;

        if !page.is_truncated() {
            self.cursor = end;
            return Ok(Some(self.decode(page.hits)));
        }

        let total = page.total;
        if let Some((hits, resume_at)) = trim_last_instant(page.hits, &self.time_field) {
            debug!(
                total,
                kept = hits.len(),
                resume_at = %resume_at,
                "Page truncated, resuming from last hit"
            );
            self.cursor = resume_at;
            return Ok(Some(self.decode(hits)));
        }

        warn!(
            total,
            start = %start,
            end = %end,
            "Page truncated without a usable resume point, bisecting"
        );
        self.bisect(start, end).await.map(Some)
    }

    /// Halve `[start, end)` until the first half fits in one page.
    async fn bisect(
        &mut self,
        start: DateTime<Utc>,
        mut end: DateTime<Utc>,
    ) -> Result<Vec<Event>, Error> {
        let mut depth = 0;

        loop {
            let mid = start + (end - start) / 2;
            if depth >= self.limits.max_split_depth || mid <= start {
                return Err(Error::WindowTooDense { start, end, depth });
            }
            depth += 1;

            let page = self.search(start, mid).await?;
            if !page.is_truncated() {
                debug!(depth, start = %start, end = %mid, hits = page.hits.len(), "Bisected page fits");
                self.cursor = mid;
                return Ok(self.decode(page.hits));
            }

            end = mid;
        }
    }

    async fn search(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<SearchPage, Error> {
        let query = self
            .template
            .page(&self.time_field, start, end, self.limits.max_page_size);

        self.source
            .search(&query)
            .await
            .map_err(|e| Error::Query(format!("{:#}", e)))
    }

    fn decode(&self, hits: Vec<Value>) -> Vec<Event> {
        hits.into_iter()
            .filter_map(|source| match serde_json::from_value::<Event>(source) {
                Ok(event) => match validate(&event, self.scope) {
                    Ok(()) => Some(event),
                    Err(e) => {
                        warn!(error = %e, "Skipping invalid event");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable hit");
                    None
                }
            })
            .collect()
    }

    fn report(&self) {
        let mut status = lock(&self.status);
        status.sent = self.sent;
        status.cursor = self.cursor;
    }

    fn finish(&self) {
        let mut status = lock(&self.status);
        status.sent = self.sent;
        status.cursor = self.cursor;
        status.finished = true;
    }
}

/// Drop the trailing hits that share the last hit's timestamp.
///
/// Returns the remaining hits and the timestamp to resume from, so the
/// dropped hits are re-read by the next page. `None` when the time field is
/// unusable or nothing would remain.
fn trim_last_instant(mut hits: Vec<Value>, time_field: &str) -> Option<(Vec<Value>, DateTime<Utc>)> {
    let last = hit_time(hits.last()?, time_field)?;

    while let Some(hit) = hits.last() {
        if hit_time(hit, time_field)? < last {
            break;
        }
        hits.pop();
    }

    if hits.is_empty() {
        None
    } else {
        Some((hits, last))
    }
}

/// Read `field` (plain or dotted path) from a hit as an RFC 3339 timestamp.
fn hit_time(source: &Value, field: &str) -> Option<DateTime<Utc>> {
    let value = source
        .get(field)
        .or_else(|| field.split('.').try_fold(source, |v, part| v.get(part)))?;

    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn lock(status: &Mutex<FeederStatus>) -> MutexGuard<'_, FeederStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
