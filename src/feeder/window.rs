use crate::config::JobConfig;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Half-open `[start, end)` time range covered by one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Resolve the window for a run of `job`.
    ///
    /// Absolute bounds win. Otherwise the window starts at the checkpoint,
    /// falling back to `now - max_interval` and then the Unix epoch, and ends
    /// at `now - buffer`.
    pub fn resolve(
        job: &JobConfig,
        last_event_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        buffer: Duration,
    ) -> Self {
        let start = job.absolute_start.unwrap_or_else(|| {
            last_event_time
                .or_else(|| {
                    job.max_interval_minutes
                        .map(|minutes| now - Duration::minutes(minutes))
                })
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        });

        let end = job.absolute_end.unwrap_or(now - buffer);

        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }
}

/// Length of one page so that `count` events spread over `span` fit under
/// `max_page_size` hits per page.
///
/// Density is not assumed uniform, so an overflowing window is cut into twice
/// as many pages as an even spread would need.
pub fn page_duration(count: u64, max_page_size: usize, span: Duration) -> Duration {
    let max = max_page_size.max(1) as u64;
    if count <= max {
        return span;
    }

    let pages = (count / max).saturating_add(1).saturating_mul(2);
    let millis = span.num_milliseconds() / i64::try_from(pages).unwrap_or(i64::MAX);
    Duration::milliseconds(millis.max(1))
}
