use crate::directory::{DeviceInfo, Directory, RoomInfo};
use crate::error::Error;
use crate::event::Event;
use crate::metrics::record::{ClassInfo, MetricsRecord, RecordType};
use crate::schedule::{ClassSlot, ScheduleLookup};
use crate::state::{Failure, Outcome};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Completes records produced by display callbacks.
pub struct Enricher {
    directory: Arc<Directory>,
    schedule: Arc<dyn ScheduleLookup>,
}

impl Enricher {
    pub fn new(directory: Arc<Directory>, schedule: Arc<dyn ScheduleLookup>) -> Self {
        Self {
            directory,
            schedule,
        }
    }

    /// Close `record` over `[start, event.timestamp]`.
    ///
    /// Attaches device and room metadata, then splits the span at class
    /// boundaries. An unknown device or room fails with the under-enriched
    /// record attached so it is still emitted.
    pub async fn finish(
        &self,
        record: MetricsRecord,
        start: DateTime<Utc>,
        event: &Event,
    ) -> Outcome<MetricsRecord> {
        let mut record = record.span(start, event.timestamp);
        record.device = DeviceInfo {
            id: event.entity_id.clone(),
            ..Default::default()
        };
        record.room = RoomInfo {
            id: event.room_id.clone(),
            ..Default::default()
        };

        if record.record_type == RecordType::Input {
            record.input_type = record.input.as_deref().map(|input| self.input_type(input));
        }

        let Some(device) = self.directory.device(&event.entity_id) else {
            return Err(Failure::with_records(
                vec![record],
                Error::InvalidDevice(event.entity_id.clone()),
            ));
        };
        record.device = device.clone();

        let Some(room) = self.directory.room(&event.room_id) else {
            return Err(Failure::with_records(
                vec![record],
                Error::InvalidRoom(event.room_id.clone()),
            ));
        };
        record.room = room.clone();

        Ok(self.split(record).await)
    }

    /// Input devices known to the directory report their device type,
    /// anything else its name without trailing digits ("hdmi2" -> "hdmi").
    fn input_type(&self, input: &str) -> String {
        match self.directory.device(input) {
            Some(device) => device.device_type.clone(),
            None => input.trim_end_matches(|c: char| c.is_ascii_digit()).to_string(),
        }
    }

    async fn split(&self, record: MetricsRecord) -> Vec<MetricsRecord> {
        match self
            .schedule
            .classes(&record.room.id, record.start_time, record.end_time)
            .await
        {
            Ok(classes) => split_by_classes(record, &classes),
            Err(e) => {
                warn!(
                    room = %record.room.id,
                    error = %format!("{:#}", e),
                    "Class schedule unavailable, emitting record unsplit"
                );
                vec![record]
            }
        }
    }
}

/// Cut a record into consecutive sub-records at class boundaries.
///
/// Time before the first class, between classes and after the last class
/// becomes class-less padding. The sub-records exactly tile the input
/// span and each carries its own elapsed seconds.
pub fn split_by_classes(record: MetricsRecord, classes: &[ClassSlot]) -> Vec<MetricsRecord> {
    let (start, end) = (record.start_time, record.end_time);

    let mut overlapping: Vec<&ClassSlot> = classes
        .iter()
        .filter(|c| c.end > start && c.start < end)
        .collect();
    overlapping.sort_by_key(|c| c.start);

    let mut parts = Vec::new();
    let mut cursor = start;

    for class in overlapping {
        let class_start = class.start.max(cursor);
        let class_end = class.end.min(end);
        if class_end <= class_start {
            continue;
        }

        if cursor < class_start {
            parts.push(segment(&record, cursor, class_start, None));
        }

        debug!(
            class = %format!("{}-{}", class.department, class.catalog_number),
            start = %class_start,
            end = %class_end,
            "Adding class time block"
        );
        parts.push(segment(&record, class_start, class_end, Some(ClassInfo::from(class))));
        cursor = class_end;
    }

    if cursor < end || parts.is_empty() {
        parts.push(segment(&record, cursor, end, None));
    }

    parts
}

fn segment(
    record: &MetricsRecord,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    class: Option<ClassInfo>,
) -> MetricsRecord {
    let mut part = record.clone().span(start, end);
    part.class = class;
    part
}
