use crate::directory::{DeviceInfo, RoomInfo};
use crate::schedule::ClassSlot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of duration a record measures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordType {
    Input,
    Power,
    Blank,
    Volume,
    Mute,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordType::Input => "input",
            RecordType::Power => "power",
            RecordType::Blank => "blank",
            RecordType::Volume => "volume",
            RecordType::Mute => "mute",
        };
        f.write_str(name)
    }
}

/// Class held in the room during a record's time span
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClassInfo {
    pub department: String,
    pub catalog_number: String,
    pub class_name: String,
    pub credit_hours: f64,
    pub class_size: u32,
    pub class_enrollment: u32,
    pub instructor: String,
    pub class_start: DateTime<Utc>,
    pub class_end: DateTime<Utc>,
}

impl From<&ClassSlot> for ClassInfo {
    fn from(slot: &ClassSlot) -> Self {
        Self {
            department: slot.department.clone(),
            catalog_number: slot.catalog_number.clone(),
            class_name: format!("{}-{}", slot.department, slot.catalog_number),
            credit_hours: slot.credit_hours,
            class_size: slot.class_size,
            class_enrollment: slot.enrollment,
            instructor: slot.instructor.clone(),
            class_start: slot.start,
            class_end: slot.end,
        }
    }
}

/// Time a device spent in one state, as written to the metrics index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsRecord {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub elapsed_in_seconds: i64,
    pub record_type: RecordType,

    pub device: DeviceInfo,
    pub room: RoomInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ClassInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blanked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl MetricsRecord {
    /// Empty record of `record_type`; times are filled in by enrichment.
    pub fn new(record_type: RecordType) -> Self {
        Self {
            start_time: DateTime::<Utc>::UNIX_EPOCH,
            end_time: DateTime::<Utc>::UNIX_EPOCH,
            elapsed_in_seconds: 0,
            record_type,
            device: DeviceInfo::default(),
            room: RoomInfo::default(),
            class: None,
            input: None,
            input_type: None,
            volume: None,
            blanked: None,
            muted: None,
            power: None,
            tags: Vec::new(),
        }
    }

    pub fn power(value: &str) -> Self {
        Self {
            power: Some(value.to_string()),
            ..Self::new(RecordType::Power)
        }
    }

    pub fn input(value: &str) -> Self {
        Self {
            input: Some(value.to_string()),
            ..Self::new(RecordType::Input)
        }
    }

    pub fn blank(blanked: bool) -> Self {
        Self {
            blanked: Some(blanked),
            ..Self::new(RecordType::Blank)
        }
    }

    pub fn volume(level: i64) -> Self {
        Self {
            volume: Some(level),
            ..Self::new(RecordType::Volume)
        }
    }

    pub fn mute(muted: bool) -> Self {
        Self {
            muted: Some(muted),
            ..Self::new(RecordType::Mute)
        }
    }

    /// Set the covered span and the elapsed seconds derived from it.
    pub fn span(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self.elapsed_in_seconds = (end - start).num_seconds();
        self
    }

    /// Value the record tracks, for log lines
    pub fn subject(&self) -> String {
        match self.record_type {
            RecordType::Input => self.input.clone().unwrap_or_default(),
            RecordType::Power => self.power.clone().unwrap_or_default(),
            RecordType::Blank => self.blanked.map(|b| b.to_string()).unwrap_or_default(),
            RecordType::Volume => self.volume.map(|v| v.to_string()).unwrap_or_default(),
            RecordType::Mute => self.muted.map(|m| m.to_string()).unwrap_or_default(),
        }
    }
}
